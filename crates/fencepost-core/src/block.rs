//! Block and division manager.
//!
//! Requests up to half a block are rounded to a power-of-two size class and
//! served from divided blocks: one arena block cut into equal pieces that
//! wait in the free-size index. Larger requests take whole blocks, either an
//! exact-size free run or fresh arena space. Larger free runs are never split.

#![allow(unsafe_code)]

use crate::arena::ArenaSource;
use crate::constants::{BLOCK_SIZE, CHUNK_SMALLEST_BLOCK, FREE_BLANK_CHAR};
use crate::entry::EntryAllocator;
use crate::error::{ChunkError, Corruption};
use crate::events::Gated;
use crate::fence;
use crate::skiplist::{IndexKind, SkipIndex, UpdateRefs};
use crate::slot::{SlotFlags, SlotId, SlotStore};

/// True when `size` is served from a divided block.
#[must_use]
pub const fn is_divided(size: usize) -> bool {
    size <= BLOCK_SIZE / 2
}

/// Power-of-two class a divided request of `size` bytes lands in.
#[must_use]
pub const fn size_class(size: usize) -> usize {
    let size = if size < CHUNK_SMALLEST_BLOCK {
        CHUNK_SMALLEST_BLOCK
    } else {
        size
    };
    size.next_power_of_two()
}

/// Bytes reserved for a request of `size`, aligned or not. Never zero: an
/// empty block-aligned request still takes one whole block.
#[must_use]
pub const fn reserved_size(size: usize, aligned: bool) -> usize {
    if is_divided(size) && !aligned {
        size_class(size)
    } else {
        let size = if size == 0 { 1 } else { size };
        size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }
}

/// Arena block accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockCounts {
    pub user: usize,
    pub admin: usize,
    pub external: usize,
    pub free_bytes: usize,
}

/// Blank-fill policy for the current operation.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BlankPolicy {
    /// Fill new divided blocks with the free blank byte.
    pub fill_fresh: bool,
    /// Verify blanked free memory before handing it out.
    pub check_reuse: bool,
}

/// Outcome of taking a block for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Taken {
    Slot(SlotId),
    /// Reused free memory had been written to; it is retired and the
    /// address of the first dirty byte is reported.
    Dirty(usize),
}

pub(crate) struct Blocks<A: ArenaSource> {
    pub arena: A,
    pub store: SlotStore,
    pub entries: EntryAllocator,
    pub used: SkipIndex,
    pub free: SkipIndex,
    pub counts: BlockCounts,
    pub blank: BlankPolicy,
}

impl<A: ArenaSource> Blocks<A> {
    pub(crate) fn new(arena: A, seed: u64) -> Self {
        let store = SlotStore::new(arena.base());
        Self {
            arena,
            store,
            entries: EntryAllocator::new(seed),
            used: SkipIndex::new(IndexKind::Address),
            free: SkipIndex::new(IndexKind::FreeSize),
            counts: BlockCounts::default(),
            blank: BlankPolicy::default(),
        }
    }

    /// A blank slot record, growing the entry slab when its level is empty.
    pub(crate) fn acquire_slot(&mut self, log: &mut Gated<'_>) -> Result<SlotId, ChunkError> {
        let level = self.entries.random_level();
        if let Some(id) = self.entries.pop(&mut self.store, level) {
            return Ok(id);
        }

        let formatted = self
            .entries
            .grow_level(&mut self.arena, &mut self.store, level)?;
        let admin_mem = self.store.header(formatted.admin).mem;
        self.used.insert(&mut self.store, formatted.admin)?;
        self.counts.admin += 1;
        log.record(format_args!(
            "entry block for level {level} at {admin_mem:#x}"
        ));
        if let Some(surplus) = formatted.surplus {
            let header = self.store.header(surplus);
            let (mem, size) = (header.mem, header.total_size);
            self.used.insert(&mut self.store, surplus)?;
            self.counts.external += size / BLOCK_SIZE;
            log.record(format_args!("external space {size} bytes at {mem:#x}"));
        }

        self.entries
            .pop(&mut self.store, level)
            .ok_or_else(|| Corruption::EntryMagic(admin_mem).into())
    }

    /// Records a block and links it into the index matching its flags.
    fn register(
        &mut self,
        mem: usize,
        size: usize,
        flags: SlotFlags,
        log: &mut Gated<'_>,
    ) -> Result<SlotId, ChunkError> {
        let id = self.acquire_slot(log)?;
        let header = self.store.header_mut(id);
        header.mem = mem;
        header.total_size = size;
        header.flags = flags;
        let linked = if flags.contains(SlotFlags::FREE) {
            self.free.insert(&mut self.store, id)
        } else {
            self.used.insert(&mut self.store, id)
        };
        if let Err(err) = linked {
            self.entries.release(&mut self.store, id);
            return Err(err);
        }
        Ok(id)
    }

    /// Fresh arena space for user blocks. Surplus becomes an external slot.
    fn grow(&mut self, size: usize, log: &mut Gated<'_>) -> Result<usize, ChunkError> {
        let grant = self.arena.grow(size)?;
        if grant.mem % BLOCK_SIZE != 0 {
            return Err(Corruption::ArenaAlignment(grant.mem).into());
        }
        if let Some(span) = grant.surplus {
            let size = span.blocks * BLOCK_SIZE;
            self.register(span.mem, size, SlotFlags::EXTERN, log)?;
            self.counts.external += span.blocks;
            log.record(format_args!("external space {size} bytes at {:#x}", span.mem));
        }
        Ok(grant.mem)
    }

    /// Cuts one fresh block into free pieces of `class` bytes.
    fn create_divided(&mut self, class: usize, log: &mut Gated<'_>) -> Result<(), ChunkError> {
        let mem = self.grow(BLOCK_SIZE, log)?;
        self.counts.user += 1;
        let mut flags = SlotFlags::FREE;
        if self.blank.fill_fresh {
            // SAFETY: the arena just granted this block to us.
            unsafe { fence::fill(mem, mem + BLOCK_SIZE, FREE_BLANK_CHAR) };
            flags = flags | SlotFlags::BLANK;
        }
        let pieces = BLOCK_SIZE / class;
        for i in 0..pieces {
            self.register(mem + i * class, class, flags, log)?;
        }
        self.counts.free_bytes += BLOCK_SIZE;
        log.record(format_args!(
            "divided block at {mem:#x} into {pieces} pieces of {class} bytes"
        ));
        Ok(())
    }

    /// Moves the leftmost free block of exactly `size` bytes to the address
    /// index with `flags`.
    fn use_free(&mut self, size: usize, flags: SlotFlags) -> Result<Option<Taken>, ChunkError> {
        let mut update = UpdateRefs::new();
        let Some(id) = self.free.find_size(&self.store, size, &mut update)? else {
            return Ok(None);
        };
        self.free.remove(&mut self.store, id, &update)?;
        self.counts.free_bytes -= size;

        let header = self.store.header(id);
        if self.blank.check_reuse && header.flags.contains(SlotFlags::BLANK) {
            let (start, end) = (header.mem, header.mem + header.total_size);
            // SAFETY: free blocks are heap memory no user holds.
            if let Some(dirty) = unsafe { fence::first_mismatch(start, end, FREE_BLANK_CHAR) } {
                self.store.header_mut(id).flags = SlotFlags::RETIRED;
                self.used.insert(&mut self.store, id)?;
                return Ok(Some(Taken::Dirty(dirty)));
            }
        }

        let header = self.store.header_mut(id);
        header.flags = flags;
        header.user_size = 0;
        self.used.insert(&mut self.store, id)?;
        Ok(Some(Taken::Slot(id)))
    }

    /// A block of at least `total` bytes flagged `flags`, linked into the
    /// address index. Block-aligned requests always take whole blocks.
    pub(crate) fn get_memory(
        &mut self,
        total: usize,
        flags: SlotFlags,
        log: &mut Gated<'_>,
    ) -> Result<Taken, ChunkError> {
        let aligned = flags.contains(SlotFlags::VALLOC);
        let size = reserved_size(total, aligned);
        if is_divided(total) && !aligned {
            if let Some(taken) = self.use_free(size, flags)? {
                return Ok(taken);
            }
            self.create_divided(size, log)?;
            return self
                .use_free(size, flags)?
                .ok_or_else(|| Corruption::DividedMiss(size).into());
        }

        if let Some(taken) = self.use_free(size, flags)? {
            return Ok(taken);
        }
        let mem = self.grow(size, log)?;
        self.counts.user += size / BLOCK_SIZE;
        let id = self.register(mem, size, flags, log)?;
        log.record(format_args!(
            "{} blocks for {size} bytes at {mem:#x}",
            size / BLOCK_SIZE
        ));
        Ok(Taken::Slot(id))
    }

    /// Moves a released user block to the free-size index.
    pub(crate) fn release_to_free(
        &mut self,
        id: SlotId,
        update: &UpdateRefs,
        blanked: bool,
    ) -> Result<(), ChunkError> {
        self.used.remove(&mut self.store, id, update)?;
        let header = self.store.header_mut(id);
        header.flags = released_flags(SlotFlags::FREE, header.flags, blanked);
        let size = header.total_size;
        self.free.insert(&mut self.store, id)?;
        self.counts.free_bytes += size;
        Ok(())
    }

    /// Keeps a released block in the address index so it is never reused.
    pub(crate) fn retire(&mut self, id: SlotId, blanked: bool) {
        let header = self.store.header_mut(id);
        header.flags = released_flags(SlotFlags::RETIRED, header.flags, blanked);
    }
}

/// State of a released block. Layout bits stay so reports can still name
/// the user pointer.
fn released_flags(state: SlotFlags, old: SlotFlags, blanked: bool) -> SlotFlags {
    let flags = state | old.layout();
    if blanked { flags | SlotFlags::BLANK } else { flags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ReservedArena;
    use crate::events::NullSink;

    fn blocks(granule: usize) -> Blocks<ReservedArena> {
        let arena = ReservedArena::with_granule(256 * BLOCK_SIZE, granule)
            .expect("reservation should succeed");
        Blocks::new(arena, 11)
    }

    fn slot(taken: Taken) -> SlotId {
        match taken {
            Taken::Slot(id) => id,
            Taken::Dirty(addr) => panic!("unexpected dirty block at {addr:#x}"),
        }
    }

    #[test]
    fn size_classes_are_smallest_fitting_power_of_two() {
        assert_eq!(size_class(1), CHUNK_SMALLEST_BLOCK);
        assert_eq!(size_class(CHUNK_SMALLEST_BLOCK), CHUNK_SMALLEST_BLOCK);
        assert_eq!(size_class(CHUNK_SMALLEST_BLOCK + 1), 2 * CHUNK_SMALLEST_BLOCK);
        assert_eq!(size_class(BLOCK_SIZE / 2), BLOCK_SIZE / 2);
        assert_eq!(reserved_size(BLOCK_SIZE / 2 + 1, false), BLOCK_SIZE);
        assert_eq!(reserved_size(3 * BLOCK_SIZE + 1, false), 4 * BLOCK_SIZE);
        assert_eq!(reserved_size(10, true), BLOCK_SIZE);
        assert_eq!(reserved_size(0, true), BLOCK_SIZE);
    }

    #[test]
    fn divided_request_fills_free_index_with_siblings() {
        let mut b = blocks(1);
        let mut sink = NullSink;
        let mut log = Gated::new(&mut sink, false);
        let id = slot(b.get_memory(100, SlotFlags::USER, &mut log).unwrap());
        assert_eq!(b.store.header(id).total_size, 128);
        assert_eq!(b.store.header(id).mem % 128, 0);
        assert_eq!(b.free.len(), BLOCK_SIZE / 128 - 1);
        assert_eq!(b.counts.free_bytes, BLOCK_SIZE - 128);
        assert_eq!(b.counts.user, 1);
        assert_eq!(b.counts.admin, b.entries.block_count());

        let again = slot(b.get_memory(120, SlotFlags::USER, &mut log).unwrap());
        assert_eq!(b.store.header(again).total_size, 128);
        assert_eq!(b.counts.user, 1);
    }

    #[test]
    fn multi_block_request_bypasses_free_index() {
        let mut b = blocks(1);
        let mut sink = NullSink;
        let mut log = Gated::new(&mut sink, false);
        let id = slot(b.get_memory(5000, SlotFlags::USER, &mut log).unwrap());
        let header = b.store.header(id);
        assert_eq!(header.total_size, 2 * BLOCK_SIZE);
        assert_eq!(header.mem % BLOCK_SIZE, 0);
        assert_eq!(b.free.len(), 0);
        assert_eq!(b.counts.user, 2);
    }

    #[test]
    fn released_multi_block_is_reused_only_on_exact_size() {
        let mut b = blocks(1);
        let mut sink = NullSink;
        let mut log = Gated::new(&mut sink, false);
        let id = slot(b.get_memory(3 * BLOCK_SIZE, SlotFlags::USER, &mut log).unwrap());
        let mem = b.store.header(id).mem;
        let mut update = UpdateRefs::new();
        assert_eq!(b.used.find_address(&b.store, mem, true, &mut update), Some(id));
        b.release_to_free(id, &update, false).unwrap();

        let smaller = slot(b.get_memory(2 * BLOCK_SIZE, SlotFlags::USER, &mut log).unwrap());
        assert_ne!(b.store.header(smaller).mem, mem);
        let same = slot(b.get_memory(3 * BLOCK_SIZE, SlotFlags::USER, &mut log).unwrap());
        assert_eq!(b.store.header(same).mem, mem);
    }

    #[test]
    fn surplus_is_registered_as_external() {
        let mut b = blocks(4);
        let mut sink = NullSink;
        let mut log = Gated::new(&mut sink, false);
        slot(b.get_memory(2 * BLOCK_SIZE, SlotFlags::USER, &mut log).unwrap());
        assert!(b.counts.external >= 2);
        let externals = b
            .used
            .iter(&b.store)
            .filter(|id| b.store.header(*id).flags == SlotFlags::EXTERN)
            .count();
        assert!(externals >= 1);
        b.used.check(&b.store, true).unwrap();
    }

    #[test]
    fn admin_events_are_logged() {
        let mut b = blocks(1);
        let mut lines: Vec<String> = Vec::new();
        let mut sink = |args: core::fmt::Arguments<'_>| lines.push(args.to_string());
        let mut log = Gated::new(&mut sink, true);
        slot(b.get_memory(64, SlotFlags::USER, &mut log).unwrap());
        drop(log);
        assert!(lines.iter().any(|l| l.starts_with("entry block for level")));
        assert!(lines.iter().any(|l| l.contains("pieces of 64 bytes")));
    }

    #[test]
    fn dirty_blank_memory_is_retired_on_reuse() {
        let mut b = blocks(1);
        b.blank = BlankPolicy {
            fill_fresh: true,
            check_reuse: true,
        };
        let mut sink = NullSink;
        let mut log = Gated::new(&mut sink, false);
        let first = slot(b.get_memory(2000, SlotFlags::USER, &mut log).unwrap());
        let sibling_mem = b.store.header(first).mem ^ 2048;
        // SAFETY: the sibling piece is free heap memory in this arena.
        unsafe { ((sibling_mem + 5) as *mut u8).write(0) };
        assert_eq!(
            b.get_memory(2000, SlotFlags::USER, &mut log).unwrap(),
            Taken::Dirty(sibling_mem + 5)
        );
        let retired = b.used.iter(&b.store).find(|id| b.store.header(*id).mem == sibling_mem);
        assert!(retired.is_some());
    }
}
