//! Arena sources: the growable byte range the chunk allocator carves up.
//!
//! An arena only ever grows at its end, in whole blocks, and never moves.
//! A source may hand out more than was asked for; the surplus is reported in
//! the [`Grant`] and registered by the heap as externally sourced memory.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::constants::{BLOCK_SIZE, MAX_ARENA_SPAN};
use crate::error::ChunkError;

/// Surplus handed out together with a grow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternSpan {
    pub mem: usize,
    pub blocks: usize,
}

/// Result of one [`ArenaSource::grow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Start of the requested span, block aligned.
    pub mem: usize,
    /// Space the source added beyond the request, if any.
    pub surplus: Option<ExternSpan>,
}

/// A growable, never-moving byte range.
///
/// # Safety
///
/// Implementations must guarantee that every span returned by `grow` is
/// readable and writable for its full length, block aligned, and stays valid
/// and untouched by anyone else for as long as the source lives.
pub unsafe trait ArenaSource {
    /// Fixed start of the arena. Every granted span lies at or above it.
    fn base(&self) -> usize;

    /// Extends the arena by at least `min_bytes`, a multiple of the block size.
    fn grow(&mut self, min_bytes: usize) -> Result<Grant, ChunkError>;

    /// `[start, end)` of the memory handed out so far.
    fn bounds(&self) -> (usize, usize);
}

/// Arena backed by one up-front reservation from the global allocator.
///
/// `granule_blocks` forces every grow to hand out at least that many blocks,
/// which exercises the surplus path the way a page-rounding source would.
pub struct ReservedArena {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    granule_blocks: usize,
}

// SAFETY: the reservation is owned exclusively by this value.
unsafe impl Send for ReservedArena {}

impl ReservedArena {
    /// Reserve `capacity` bytes (rounded up to whole blocks).
    pub fn new(capacity: usize) -> Result<Self, ChunkError> {
        Self::with_granule(capacity, 1)
    }

    /// Reserve `capacity` bytes and grow in units of at least `granule_blocks`.
    pub fn with_granule(capacity: usize, granule_blocks: usize) -> Result<Self, ChunkError> {
        let capacity = capacity
            .checked_next_multiple_of(BLOCK_SIZE)
            .filter(|c| *c > 0 && *c <= MAX_ARENA_SPAN)
            .ok_or(ChunkError::ArenaExhausted(capacity))?;
        let layout = Layout::from_size_align(capacity, BLOCK_SIZE)
            .map_err(|_| ChunkError::ArenaExhausted(capacity))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(ChunkError::ArenaExhausted(capacity))?;
        Ok(Self {
            base,
            capacity,
            used: 0,
            granule_blocks: granule_blocks.max(1),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

// SAFETY: spans come from a single live reservation, are block aligned since
// the reservation is, and are never handed out twice.
unsafe impl ArenaSource for ReservedArena {
    fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn grow(&mut self, min_bytes: usize) -> Result<Grant, ChunkError> {
        let need = min_bytes
            .checked_next_multiple_of(BLOCK_SIZE)
            .ok_or(ChunkError::ArenaExhausted(min_bytes))?;
        let granted = need.max(self.granule_blocks * BLOCK_SIZE);
        if granted > self.capacity - self.used {
            return Err(ChunkError::ArenaExhausted(min_bytes));
        }
        let mem = self.base() + self.used;
        self.used += granted;
        let surplus = (granted > need).then(|| ExternSpan {
            mem: mem + need,
            blocks: (granted - need) / BLOCK_SIZE,
        });
        Ok(Grant { mem, surplus })
    }

    fn bounds(&self) -> (usize, usize) {
        (self.base(), self.base() + self.used)
    }
}

impl Drop for ReservedArena {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.capacity, BLOCK_SIZE) {
            // SAFETY: base was allocated in `with_granule` with this layout.
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_is_contiguous_and_block_aligned() {
        let mut arena = ReservedArena::new(16 * BLOCK_SIZE).expect("reservation should succeed");
        let a = arena.grow(BLOCK_SIZE).unwrap();
        let b = arena.grow(2 * BLOCK_SIZE).unwrap();
        assert_eq!(a.mem % BLOCK_SIZE, 0);
        assert_eq!(b.mem, a.mem + BLOCK_SIZE);
        assert_eq!(a.surplus, None);
        assert_eq!(arena.bounds(), (arena.base(), arena.base() + 3 * BLOCK_SIZE));
    }

    #[test]
    fn partial_block_requests_round_up() {
        let mut arena = ReservedArena::new(4 * BLOCK_SIZE).unwrap();
        arena.grow(10).unwrap();
        assert_eq!(arena.used(), BLOCK_SIZE);
    }

    #[test]
    fn granule_reports_surplus() {
        let mut arena = ReservedArena::with_granule(16 * BLOCK_SIZE, 4).unwrap();
        let grant = arena.grow(BLOCK_SIZE).unwrap();
        assert_eq!(
            grant.surplus,
            Some(ExternSpan {
                mem: grant.mem + BLOCK_SIZE,
                blocks: 3
            })
        );
        assert_eq!(arena.used(), 4 * BLOCK_SIZE);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut arena = ReservedArena::new(2 * BLOCK_SIZE).unwrap();
        arena.grow(2 * BLOCK_SIZE).unwrap();
        assert_eq!(
            arena.grow(BLOCK_SIZE),
            Err(ChunkError::ArenaExhausted(BLOCK_SIZE))
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ReservedArena::new(0).is_err());
    }
}
