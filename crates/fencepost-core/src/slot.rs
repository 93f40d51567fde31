//! Slot records: the per-block metadata threaded through both skip lists.
//!
//! Records live inside entry blocks in the arena. They are addressed by
//! [`SlotId`], an offset from the arena base counted in [`SLOT_GRANULE`]
//! units, so no raw record pointer ever leaves this module.

#![allow(unsafe_code)]

use core::fmt;
use core::mem::size_of;
use core::num::NonZeroU32;
use core::panic::Location;

use crate::constants::{MAX_FILE_LENGTH, MAX_LINE_NUMBER, MIN_FILE_LENGTH, SLOT_GRANULE};

/// Handle of one slot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SlotId(NonZeroU32);

/// State and layout bits of a slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(transparent)]
pub struct SlotFlags(u32);

impl SlotFlags {
    /// Handed out to a user.
    pub const USER: Self = Self(1 << 0);
    /// Linked into the free-size index.
    pub const FREE: Self = Self(1 << 1);
    /// Surplus the arena handed out without being asked.
    pub const EXTERN: Self = Self(1 << 2);
    /// Entry block holding slot records.
    pub const ADMIN: Self = Self(1 << 3);
    /// Released under never-reuse; kept in the address index forever.
    pub const RETIRED: Self = Self(1 << 4);
    /// Surrounded by fence posts.
    pub const FENCE: Self = Self(1 << 10);
    /// User pointer is block aligned.
    pub const VALLOC: Self = Self(1 << 11);
    /// Free memory was overwritten with the free blank byte.
    pub const BLANK: Self = Self(1 << 12);

    const STATE_MASK: u32 = 0x1F;

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Everything but the state bits.
    #[must_use]
    pub const fn layout(self) -> Self {
        Self(self.0 & !Self::STATE_MASK)
    }

    /// Exactly one state bit is set.
    #[must_use]
    pub const fn has_single_state(self) -> bool {
        (self.0 & Self::STATE_MASK).count_ones() == 1
    }
}

impl core::ops::BitOr for SlotFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Where an allocation was requested from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSite {
    #[default]
    Unknown,
    Location { file: &'static str, line: u32 },
    ReturnAddress(usize),
}

impl CallSite {
    /// Location of the caller of the function this is called from.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Self::Location {
            file: loc.file(),
            line: loc.line(),
        }
    }

    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Line number and file name length are plausible.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        match self {
            Self::Location { file, line } => {
                *line <= MAX_LINE_NUMBER
                    && file.len() >= MIN_FILE_LENGTH
                    && file.len() <= MAX_FILE_LENGTH
            }
            Self::Unknown | Self::ReturnAddress(_) => true,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Location { file, line } => write!(f, "{file}:{line}"),
            Self::ReturnAddress(ra) => write!(f, "ra={ra:#x}"),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CallSite {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fixed part of a slot record. Forward links follow it in memory.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct SlotHeader {
    pub flags: SlotFlags,
    pub level: u32,
    pub user_size: usize,
    pub total_size: usize,
    pub mem: usize,
    pub site: CallSite,
    pub use_iter: u64,
}

impl SlotHeader {
    const fn blank(level: u32) -> Self {
        Self {
            flags: SlotFlags::empty(),
            level,
            user_size: 0,
            total_size: 0,
            mem: 0,
            site: CallSite::Unknown,
            use_iter: 0,
        }
    }
}

type Link = Option<SlotId>;

/// Bytes taken by one record of `level`, rounded to the slot granule.
#[must_use]
pub(crate) const fn slot_stride(level: usize) -> usize {
    (size_of::<SlotHeader>() + (level + 1) * size_of::<Link>()).next_multiple_of(SLOT_GRANULE)
}

/// Typed access to slot records inside the arena.
///
/// Every `SlotId` handed to these methods must come from
/// [`SlotStore::format`], which is only called on formatted entry-block space.
pub(crate) struct SlotStore {
    base: usize,
}

impl SlotStore {
    pub(crate) const fn new(base: usize) -> Self {
        Self { base }
    }

    fn record_addr(&self, id: SlotId) -> usize {
        self.base + id.0.get() as usize * SLOT_GRANULE
    }

    /// Address the record of `id` lives at.
    #[cfg(test)]
    pub(crate) fn address_of(&self, id: SlotId) -> usize {
        self.record_addr(id)
    }

    /// Writes a blank record of `level` at `addr` and returns its handle.
    ///
    /// Returns `None` when `addr` is misaligned or at the arena base.
    pub(crate) fn format(&mut self, addr: usize, level: usize) -> Option<SlotId> {
        let offset = addr.checked_sub(self.base)?;
        if offset % SLOT_GRANULE != 0 {
            return None;
        }
        let raw = u32::try_from(offset / SLOT_GRANULE).ok()?;
        let id = SlotId(NonZeroU32::new(raw)?);
        let level_u32 = u32::try_from(level).ok()?;
        // SAFETY: callers pass space inside a formatted entry block with room
        // for `slot_stride(level)` bytes; the address is granule aligned.
        unsafe {
            let header = addr as *mut SlotHeader;
            header.write(SlotHeader::blank(level_u32));
            let links = header.add(1).cast::<Link>();
            for k in 0..=level {
                links.add(k).write(None);
            }
        }
        Some(id)
    }

    pub(crate) fn header(&self, id: SlotId) -> &SlotHeader {
        // SAFETY: `id` names a record written by `format`.
        unsafe { &*(self.record_addr(id) as *const SlotHeader) }
    }

    pub(crate) fn header_mut(&mut self, id: SlotId) -> &mut SlotHeader {
        // SAFETY: `id` names a record written by `format`; `&mut self`
        // guarantees no other reference into the store is live.
        unsafe { &mut *(self.record_addr(id) as *mut SlotHeader) }
    }

    pub(crate) fn level(&self, id: SlotId) -> usize {
        self.header(id).level as usize
    }

    fn link_ptr(&self, id: SlotId, level: usize) -> *mut Link {
        debug_assert!(level <= self.level(id));
        // SAFETY: links directly follow the header and `level` is within the
        // record's link array.
        unsafe {
            (self.record_addr(id) as *mut SlotHeader)
                .add(1)
                .cast::<Link>()
                .add(level)
        }
    }

    pub(crate) fn next(&self, id: SlotId, level: usize) -> Option<SlotId> {
        // SAFETY: see `link_ptr`.
        unsafe { self.link_ptr(id, level).read() }
    }

    pub(crate) fn set_next(&mut self, id: SlotId, level: usize, next: Option<SlotId>) {
        // SAFETY: see `link_ptr`.
        unsafe { self.link_ptr(id, level).write(next) }
    }

    /// Resets a recycled record to a blank state, keeping its level.
    pub(crate) fn clear(&mut self, id: SlotId) {
        let level = self.level(id);
        *self.header_mut(id) = SlotHeader::blank(level as u32);
        for k in 0..=level {
            self.set_next(id, k, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_grows_with_level_and_stays_aligned() {
        for level in 0..32 {
            assert_eq!(slot_stride(level) % SLOT_GRANULE, 0);
            assert!(slot_stride(level + 1) >= slot_stride(level));
        }
        assert!(slot_stride(0) >= size_of::<SlotHeader>() + size_of::<Link>());
    }

    #[test]
    fn link_is_four_bytes() {
        assert_eq!(size_of::<Link>(), 4);
    }

    #[test]
    fn caller_site_is_consistent() {
        let site = CallSite::caller();
        assert!(site.is_known());
        assert!(site.is_consistent());
        assert!(site.to_string().contains("slot.rs:"));
    }

    #[test]
    fn implausible_sites_are_inconsistent() {
        let long_line = CallSite::Location {
            file: "main.rs",
            line: MAX_LINE_NUMBER + 1,
        };
        let short_file = CallSite::Location { file: "a", line: 3 };
        assert!(!long_line.is_consistent());
        assert!(!short_file.is_consistent());
        assert!(CallSite::ReturnAddress(0x400000).is_consistent());
    }

    #[test]
    fn call_site_display() {
        assert_eq!(CallSite::Unknown.to_string(), "unknown");
        assert_eq!(CallSite::ReturnAddress(0x1234).to_string(), "ra=0x1234");
        let site = CallSite::Location {
            file: "src/lib.rs",
            line: 12,
        };
        assert_eq!(site.to_string(), "src/lib.rs:12");
    }

    #[test]
    fn store_formats_and_links_records() {
        let mut buf = vec![0u64; 256];
        let base = buf.as_mut_ptr() as usize;
        let mut store = SlotStore::new(base);
        assert!(store.format(base, 0).is_none());
        let a = store.format(base + 64, 2).expect("aligned address");
        let b = store.format(base + 64 + slot_stride(2), 0).expect("aligned address");
        assert_eq!(store.level(a), 2);
        assert_eq!(store.next(a, 1), None);
        store.set_next(a, 1, Some(b));
        store.header_mut(b).mem = 0xABC;
        assert_eq!(store.next(a, 1), Some(b));
        assert_eq!(store.header(b).mem, 0xABC);
        assert_eq!(store.address_of(b), base + 64 + slot_stride(2));
        store.clear(a);
        assert_eq!(store.next(a, 1), None);
        assert_eq!(store.level(a), 2);
    }

    #[test]
    fn flag_state_helpers() {
        let user = SlotFlags::USER | SlotFlags::FENCE;
        assert!(user.has_single_state());
        assert_eq!(user.layout(), SlotFlags::FENCE);
        assert!(!(SlotFlags::USER | SlotFlags::FREE).has_single_state());
    }
}
