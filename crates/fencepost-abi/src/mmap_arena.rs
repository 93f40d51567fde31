//! Arena backed by one anonymous `mmap` reservation.
//!
//! The whole address range is mapped up front with `MAP_NORESERVE`, so pages
//! are only committed when the heap first touches them. Growing is a bump of
//! the used mark and never calls back into any allocator.

use std::ptr;

use fencepost_core::constants::BLOCK_SIZE;
use fencepost_core::{ArenaSource, ChunkError, Corruption, Grant};

/// Address space reserved when no size is given.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_RESERVE: usize = 8 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_RESERVE: usize = 256 << 20;

pub struct MmapArena {
    base: usize,
    reserved: usize,
    used: usize,
}

// SAFETY: the mapping is owned exclusively by this value.
unsafe impl Send for MmapArena {}

impl MmapArena {
    /// Maps `bytes` (rounded up to whole blocks) of address space.
    pub fn reserve(bytes: usize) -> Result<Self, ChunkError> {
        let len = bytes.max(BLOCK_SIZE).next_multiple_of(BLOCK_SIZE);
        // SAFETY: anonymous private mapping with no address hint.
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(ChunkError::ArenaExhausted(len));
        }
        let base = mem as usize;
        if base % BLOCK_SIZE != 0 {
            // SAFETY: unmapping the region mapped just above.
            unsafe { libc::munmap(mem, len) };
            return Err(Corruption::ArenaAlignment(base).into());
        }
        Ok(Self {
            base,
            reserved: len,
            used: 0,
        })
    }

    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

// SAFETY: every granted span lies inside the private mapping, which stays
// mapped until drop and is handed out only once.
unsafe impl ArenaSource for MmapArena {
    fn base(&self) -> usize {
        self.base
    }

    fn grow(&mut self, min_bytes: usize) -> Result<Grant, ChunkError> {
        let len = min_bytes
            .checked_next_multiple_of(BLOCK_SIZE)
            .filter(|len| *len <= self.reserved - self.used)
            .ok_or(ChunkError::ArenaExhausted(min_bytes))?;
        let mem = self.base + self.used;
        self.used += len;
        Ok(Grant { mem, surplus: None })
    }

    fn bounds(&self) -> (usize, usize) {
        (self.base, self.base + self.used)
    }
}

impl Drop for MmapArena {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by `reserve` with this length.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.reserved) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_in_whole_blocks_from_base() {
        let mut arena = MmapArena::reserve(16 * BLOCK_SIZE).expect("mmap should succeed");
        assert_eq!(arena.base() % BLOCK_SIZE, 0);
        let first = arena.grow(1).unwrap();
        assert_eq!(first.mem, arena.base());
        assert!(first.surplus.is_none());
        let second = arena.grow(BLOCK_SIZE + 1).unwrap();
        assert_eq!(second.mem, arena.base() + BLOCK_SIZE);
        assert_eq!(arena.used(), 3 * BLOCK_SIZE);
        assert_eq!(arena.bounds(), (arena.base(), arena.base() + 3 * BLOCK_SIZE));
        // SAFETY: the granted block is mapped read/write.
        unsafe { (second.mem as *mut u8).write(0xAA) };
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = MmapArena::reserve(2 * BLOCK_SIZE).unwrap();
        assert_eq!(arena.reserved(), 2 * BLOCK_SIZE);
        arena.grow(2 * BLOCK_SIZE).unwrap();
        assert_eq!(arena.grow(1), Err(ChunkError::ArenaExhausted(1)));
        assert_eq!(arena.grow(usize::MAX), Err(ChunkError::ArenaExhausted(usize::MAX)));
    }
}
