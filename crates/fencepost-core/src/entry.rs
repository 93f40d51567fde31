//! Entry slot allocator.
//!
//! Slot records are carved from dedicated arena blocks ("entry blocks"), one
//! skip level per block. Each level keeps its own free list threaded through
//! link 0 of the free records. This slab never goes through the general
//! allocation path, so growing it cannot recurse into the indexes it serves.
//!
//! Entry block layout:
//!
//! ```text
//! +--------+-------+------+--------+ +--------+--------+-----+ +--------+
//! | MAGIC1 | level | next | MAGIC2 | | slot 0 | slot 1 | ... | | MAGIC3 |
//! +--------+-------+------+--------+ +--------+--------+-----+ +--------+
//! ```

#![allow(unsafe_code)]

use core::mem::size_of;

use crate::arena::{ArenaSource, ExternSpan};
use crate::constants::{
    BLOCK_SIZE, ENTRY_BLOCK_MAGIC1, ENTRY_BLOCK_MAGIC2, ENTRY_BLOCK_MAGIC3, MAX_SKIP_LEVEL,
    SLOT_GRANULE,
};
use crate::error::{ChunkError, Corruption};
use crate::slot::{SlotFlags, SlotId, SlotStore, slot_stride};

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct EntryBlockHeader {
    magic1: u32,
    level: u32,
    next: usize,
    magic2: u32,
}

const HEADER_SIZE: usize = size_of::<EntryBlockHeader>().next_multiple_of(SLOT_GRANULE);
const TRAILER_OFFSET: usize = BLOCK_SIZE - size_of::<u32>();

/// Number of records of `level` that fit in one entry block.
#[must_use]
pub(crate) const fn slots_per_block(level: usize) -> usize {
    (TRAILER_OFFSET - HEADER_SIZE) / slot_stride(level)
}

/// xorshift64* generator driving skip levels.
#[derive(Debug, Clone, Copy)]
pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub(crate) const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Records set aside when a new entry block is formatted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Formatted {
    /// Describes the entry block itself.
    pub admin: SlotId,
    /// Describes surplus the arena returned along with the block.
    pub surplus: Option<SlotId>,
}

pub(crate) struct EntryAllocator {
    free: [Option<SlotId>; MAX_SKIP_LEVEL],
    free_counts: [usize; MAX_SKIP_LEVEL],
    chains: [usize; MAX_SKIP_LEVEL],
    block_count: usize,
    rng: XorShift64,
}

impl EntryAllocator {
    pub(crate) const fn new(seed: u64) -> Self {
        Self {
            free: [None; MAX_SKIP_LEVEL],
            free_counts: [0; MAX_SKIP_LEVEL],
            chains: [0; MAX_SKIP_LEVEL],
            block_count: 0,
            rng: XorShift64::new(seed),
        }
    }

    /// Geometric level: each extra level with probability 1/2.
    pub(crate) fn random_level(&mut self) -> usize {
        let ones = self.rng.next_u64().trailing_ones() as usize;
        ones.min(MAX_SKIP_LEVEL - 1)
    }

    #[must_use]
    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    #[must_use]
    pub(crate) fn free_count(&self, level: usize) -> usize {
        self.free_counts[level]
    }

    /// Takes a blank record of `level` off its free list.
    pub(crate) fn pop(&mut self, store: &mut SlotStore, level: usize) -> Option<SlotId> {
        let id = self.free[level]?;
        self.free[level] = store.next(id, 0);
        self.free_counts[level] -= 1;
        store.clear(id);
        Some(id)
    }

    /// Returns a defunct record to its level's free list.
    pub(crate) fn release(&mut self, store: &mut SlotStore, id: SlotId) {
        let level = store.level(id);
        store.clear(id);
        store.set_next(id, 0, self.free[level]);
        self.free[level] = Some(id);
        self.free_counts[level] += 1;
    }

    /// Carves a new entry block of `level` from the arena.
    ///
    /// The records describing the block itself and any arena surplus are
    /// taken from the fresh block and returned filled in; the caller links
    /// them into the address index.
    pub(crate) fn grow_level<A: ArenaSource>(
        &mut self,
        arena: &mut A,
        store: &mut SlotStore,
        level: usize,
    ) -> Result<Formatted, ChunkError> {
        let grant = arena.grow(BLOCK_SIZE)?;
        let block = grant.mem;
        if block % BLOCK_SIZE != 0 {
            return Err(Corruption::ArenaAlignment(block).into());
        }

        // SAFETY: the arena just granted BLOCK_SIZE writable, block-aligned
        // bytes at `block`; header and trailer lie inside them.
        unsafe {
            (block as *mut EntryBlockHeader).write(EntryBlockHeader {
                magic1: ENTRY_BLOCK_MAGIC1,
                level: level as u32,
                next: self.chains[level],
                magic2: ENTRY_BLOCK_MAGIC2,
            });
            ((block + TRAILER_OFFSET) as *mut u32).write(ENTRY_BLOCK_MAGIC3);
        }
        self.chains[level] = block;
        self.block_count += 1;

        // Push in reverse so records come back out in address order.
        let stride = slot_stride(level);
        for i in (0..slots_per_block(level)).rev() {
            let id = store
                .format(block + HEADER_SIZE + i * stride, level)
                .ok_or(Corruption::ArenaAlignment(block))?;
            store.set_next(id, 0, self.free[level]);
            self.free[level] = Some(id);
            self.free_counts[level] += 1;
        }

        let admin = self.pop(store, level).ok_or(Corruption::EntryMagic(block))?;
        let header = store.header_mut(admin);
        header.flags = SlotFlags::ADMIN;
        header.mem = block;
        header.user_size = BLOCK_SIZE;
        header.total_size = BLOCK_SIZE;

        let surplus = match grant.surplus {
            Some(span) => Some(self.extern_slot(store, level, span, block)?),
            None => None,
        };
        Ok(Formatted { admin, surplus })
    }

    fn extern_slot(
        &mut self,
        store: &mut SlotStore,
        level: usize,
        span: ExternSpan,
        block: usize,
    ) -> Result<SlotId, ChunkError> {
        let id = self.pop(store, level).ok_or(Corruption::EntryMagic(block))?;
        let header = store.header_mut(id);
        header.flags = SlotFlags::EXTERN;
        header.mem = span.mem;
        header.user_size = span.blocks * BLOCK_SIZE;
        header.total_size = span.blocks * BLOCK_SIZE;
        Ok(id)
    }

    /// Verifies the magic markers of every entry block.
    pub(crate) fn check_blocks(&self) -> Result<(), ChunkError> {
        for (level, head) in self.chains.iter().enumerate() {
            let mut block = *head;
            while block != 0 {
                // SAFETY: chains only hold addresses of blocks formatted by
                // `grow_level`, which stay mapped for the arena's lifetime.
                let (header, trailer) = unsafe {
                    (
                        (block as *const EntryBlockHeader).read(),
                        ((block + TRAILER_OFFSET) as *const u32).read(),
                    )
                };
                if header.magic1 != ENTRY_BLOCK_MAGIC1
                    || header.magic2 != ENTRY_BLOCK_MAGIC2
                    || trailer != ENTRY_BLOCK_MAGIC3
                    || header.level as usize != level
                {
                    return Err(Corruption::EntryMagic(block).into());
                }
                block = header.next;
            }
        }
        Ok(())
    }
}
