//! Skip-list indexes over slot records.
//!
//! Two indexes share the slot record type but never a record:
//! - the address index, keyed by `mem`, holds every in-use block
//! - the free-size index, keyed by `total_size`, holds every free block
//!
//! Searches record the last record visited on each level before dropping
//! down; those predecessors ([`UpdateRefs`]) drive insertion and removal.

use crate::constants::MAX_SKIP_LEVEL;
use crate::error::{ChunkError, Corruption};
use crate::slot::{SlotFlags, SlotId, SlotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexKind {
    Address,
    FreeSize,
}

/// Predecessor of a search position on each level; `None` is the list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpdateRefs {
    preds: [Option<SlotId>; MAX_SKIP_LEVEL],
}

impl UpdateRefs {
    pub(crate) const fn new() -> Self {
        Self {
            preds: [None; MAX_SKIP_LEVEL],
        }
    }
}

pub(crate) struct SkipIndex {
    kind: IndexKind,
    head: [Option<SlotId>; MAX_SKIP_LEVEL],
    len: usize,
}

impl SkipIndex {
    pub(crate) const fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            head: [None; MAX_SKIP_LEVEL],
            len: 0,
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn next_of(&self, store: &SlotStore, pred: Option<SlotId>, level: usize) -> Option<SlotId> {
        match pred {
            None => self.head[level],
            Some(p) => store.next(p, level),
        }
    }

    fn set_next_of(
        &mut self,
        store: &mut SlotStore,
        pred: Option<SlotId>,
        level: usize,
        next: Option<SlotId>,
    ) {
        match pred {
            None => self.head[level] = next,
            Some(p) => store.set_next(p, level, next),
        }
    }

    /// Looks up a block by address.
    ///
    /// With `exact` only a block starting at `addr` matches; otherwise any
    /// block whose `[mem, mem + total_size)` contains `addr` does.
    pub(crate) fn find_address(
        &self,
        store: &SlotStore,
        addr: usize,
        exact: bool,
        update: &mut UpdateRefs,
    ) -> Option<SlotId> {
        debug_assert_eq!(self.kind, IndexKind::Address);
        let mut pred = None;
        let mut found = None;
        for level in (0..MAX_SKIP_LEVEL).rev() {
            while let Some(next) = self.next_of(store, pred, level) {
                if Some(next) == found {
                    break;
                }
                let header = store.header(next);
                if header.mem > addr {
                    break;
                }
                if header.mem == addr
                    || (!exact && addr - header.mem < header.total_size)
                {
                    found = Some(next);
                    break;
                }
                pred = Some(next);
            }
            update.preds[level] = pred;
        }
        found
    }

    /// Leftmost free block whose total size is exactly `size`.
    pub(crate) fn find_size(
        &self,
        store: &SlotStore,
        size: usize,
        update: &mut UpdateRefs,
    ) -> Result<Option<SlotId>, ChunkError> {
        debug_assert_eq!(self.kind, IndexKind::FreeSize);
        let mut pred = None;
        for level in (0..MAX_SKIP_LEVEL).rev() {
            while let Some(next) = self.next_of(store, pred, level) {
                if store.header(next).total_size >= size {
                    break;
                }
                pred = Some(next);
            }
            update.preds[level] = pred;
        }
        match self.next_of(store, pred, 0) {
            Some(id) if store.header(id).total_size == size => {
                let header = store.header(id);
                if !header.flags.contains(SlotFlags::FREE) {
                    return Err(Corruption::NotFree(header.mem).into());
                }
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    /// Links `id` in at every level up to its own.
    pub(crate) fn insert(&mut self, store: &mut SlotStore, id: SlotId) -> Result<(), ChunkError> {
        let mut update = UpdateRefs::new();
        match self.kind {
            IndexKind::Address => {
                let mem = store.header(id).mem;
                if self.find_address(store, mem, true, &mut update).is_some() {
                    return Err(Corruption::DuplicateAddress(mem).into());
                }
            }
            IndexKind::FreeSize => {
                let size = store.header(id).total_size;
                self.find_size(store, size, &mut update)?;
            }
        }
        for level in 0..=store.level(id) {
            let pred = update.preds[level];
            let next = self.next_of(store, pred, level);
            store.set_next(id, level, next);
            self.set_next_of(store, pred, level, Some(id));
        }
        self.len += 1;
        Ok(())
    }

    /// Unlinks `id` using predecessors captured by a previous search.
    pub(crate) fn remove(
        &mut self,
        store: &mut SlotStore,
        id: SlotId,
        update: &UpdateRefs,
    ) -> Result<(), ChunkError> {
        for level in 0..MAX_SKIP_LEVEL {
            let pred = update.preds[level];
            if self.next_of(store, pred, level) != Some(id) {
                if level == 0 {
                    return Err(Corruption::Unlinked(store.header(id).mem).into());
                }
                break;
            }
            let after = store.next(id, level);
            self.set_next_of(store, pred, level, after);
        }
        self.len -= 1;
        Ok(())
    }

    /// Records on level 0, in key order.
    pub(crate) fn iter<'s>(&self, store: &'s SlotStore) -> impl Iterator<Item = SlotId> + 's {
        core::iter::successors(self.head[0], move |id| store.next(*id, 0))
    }

    /// Validates ordering on level 0, or on every level with `all_levels`.
    pub(crate) fn check(&self, store: &SlotStore, all_levels: bool) -> Result<(), ChunkError> {
        let top = if all_levels { MAX_SKIP_LEVEL } else { 1 };
        for level in 0..top {
            let mut prev: Option<SlotId> = None;
            let mut count = 0usize;
            let mut cursor = self.head[level];
            while let Some(id) = cursor {
                let header = store.header(id);
                if store.level(id) < level {
                    return Err(Corruption::BadFlags(header.mem).into());
                }
                if let Some(p) = prev {
                    self.check_pair(store, p, id)?;
                }
                count += 1;
                if count > self.len {
                    return Err(self.order_error(header.mem));
                }
                prev = Some(id);
                cursor = store.next(id, level);
            }
            if level == 0 && count != self.len {
                let mem = prev.map_or(0, |p| store.header(p).mem);
                return Err(self.order_error(mem));
            }
        }
        Ok(())
    }

    fn check_pair(&self, store: &SlotStore, prev: SlotId, cur: SlotId) -> Result<(), ChunkError> {
        let (p, c) = (store.header(prev), store.header(cur));
        let ordered = match self.kind {
            IndexKind::Address => p.mem.saturating_add(p.total_size) <= c.mem,
            IndexKind::FreeSize => p.total_size <= c.total_size,
        };
        if ordered {
            Ok(())
        } else {
            Err(self.order_error(c.mem))
        }
    }

    fn order_error(&self, mem: usize) -> ChunkError {
        match self.kind {
            IndexKind::Address => Corruption::AddressOrder(mem).into(),
            IndexKind::FreeSize => Corruption::SizeOrder(mem).into(),
        }
    }
}
