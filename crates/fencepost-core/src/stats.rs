//! Heap statistics.

/// Calls per entry point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CallCounts {
    pub malloc: u64,
    pub calloc: u64,
    pub realloc: u64,
    pub free: u64,
    pub memalign: u64,
    pub valloc: u64,
}

impl CallCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.malloc + self.calloc + self.realloc + self.free + self.memalign + self.valloc
    }
}

/// Which entry point an allocation came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    Malloc,
    Calloc,
    Memalign,
    Valloc,
}

/// Cumulative and peak usage counters.
///
/// `alloc_*` count bytes the user asked for; `given_*` count bytes reserved
/// for user blocks including fences and size-class rounding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HeapStats {
    pub alloc_current: usize,
    pub alloc_max: usize,
    pub alloc_total: u64,
    pub alloc_one_max: usize,
    pub pointers_current: usize,
    pub pointers_max: usize,
    pub pointers_total: u64,
    pub given_current: usize,
    pub given_max: usize,
    pub user_blocks: usize,
    pub admin_blocks: usize,
    pub extern_blocks: usize,
    pub free_bytes: usize,
    pub calls: CallCounts,
}

impl HeapStats {
    pub(crate) fn count_call(&mut self, kind: AllocKind) {
        match kind {
            AllocKind::Malloc => self.calls.malloc += 1,
            AllocKind::Calloc => self.calls.calloc += 1,
            AllocKind::Memalign => self.calls.memalign += 1,
            AllocKind::Valloc => self.calls.valloc += 1,
        }
    }

    pub(crate) fn record_alloc(&mut self, user: usize, given: usize) {
        self.alloc_current += user;
        self.alloc_total += user as u64;
        self.alloc_max = self.alloc_max.max(self.alloc_current);
        self.alloc_one_max = self.alloc_one_max.max(user);
        self.given_current += given;
        self.given_max = self.given_max.max(self.given_current);
        self.pointers_current += 1;
        self.pointers_total += 1;
        self.pointers_max = self.pointers_max.max(self.pointers_current);
    }

    pub(crate) fn record_free(&mut self, user: usize, given: usize) {
        self.alloc_current = self.alloc_current.saturating_sub(user);
        self.given_current = self.given_current.saturating_sub(given);
        self.pointers_current = self.pointers_current.saturating_sub(1);
    }

    /// In-place size change of a live block.
    pub(crate) fn record_resize(&mut self, old_user: usize, new_user: usize) {
        self.alloc_current = self.alloc_current.saturating_sub(old_user) + new_user;
        self.alloc_max = self.alloc_max.max(self.alloc_current);
        self.alloc_one_max = self.alloc_one_max.max(new_user);
        if new_user > old_user {
            self.alloc_total += (new_user - old_user) as u64;
        }
    }

    /// Bytes reserved for live user blocks beyond what was asked for.
    #[must_use]
    pub const fn rounding_loss(&self) -> usize {
        self.given_current.saturating_sub(self.alloc_current)
    }
}
