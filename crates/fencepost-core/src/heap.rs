//! Allocation API over the chunk allocator.
//!
//! [`ChunkHeap`] owns one arena, both indexes and the statistics. It is the
//! explicit context object for the whole allocator: the C ABI keeps one
//! behind a lock, tests create as many as they like.
//!
//! Every public mutating call:
//! - bumps the iteration counter stamped on touched slots
//! - runs the heap validator first when check-heap is on
//! - records a failure as the last error and reports it to the event sink

#![allow(unsafe_code)]

use core::fmt;
use core::ptr::NonNull;

use crate::arena::ArenaSource;
use crate::block::{BlankPolicy, Blocks, Taken};
use crate::constants::{
    ALLOC_BLANK_CHAR, ALLOCATION_ALIGNMENT, BLOCK_SIZE, DUMP_SPACE, FENCE_TOP_SIZE,
    FREE_BLANK_CHAR, LARGEST_ALLOCATION, MAX_SKIP_LEVEL,
};
use crate::error::{ChunkError, Corruption, ErrorCode, FenceSide};
use crate::events::{EventSink, Gated, NullSink};
use crate::fence::{self, ByteDump, PointerInfo};
use crate::flags::DebugFlags;
use crate::options::AddressBreak;
use crate::skiplist::UpdateRefs;
use crate::slot::{CallSite, SlotFlags, SlotId};
use crate::stats::{AllocKind, HeapStats};

/// Construction-time settings of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub flags: DebugFlags,
    /// Seed for skip levels.
    pub seed: u64,
    /// Validate the heap every this many operations while check-heap is on.
    pub check_interval: Option<u32>,
    pub watch: Option<AddressBreak>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            flags: DebugFlags::empty(),
            seed: 0x5EED_F00D,
            check_interval: None,
            watch: None,
        }
    }
}

/// What the heap knows about one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AllocationInfo {
    pub pointer: usize,
    pub user_size: usize,
    pub total_size: usize,
    pub site: CallSite,
    pub fenced: bool,
    pub aligned: bool,
    /// Iteration of the last operation that touched the block.
    pub use_iter: u64,
    pub layout: PointerInfo,
}

/// One entry of the free-size index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FreeBlock {
    pub mem: usize,
    pub size: usize,
}

fn emit<S: EventSink>(sink: &mut S, iteration: u64, args: fmt::Arguments<'_>) {
    sink.record(format_args!("{iteration}: {args}"));
}

fn user_ptr(info: &PointerInfo) -> Result<NonNull<u8>, ChunkError> {
    NonNull::new(info.user_start as *mut u8)
        .ok_or_else(|| Corruption::OutsideArena(info.alloc_start).into())
}

pub struct ChunkHeap<A: ArenaSource, S: EventSink = NullSink> {
    blocks: Blocks<A>,
    sink: S,
    flags: DebugFlags,
    stats: HeapStats,
    iteration: u64,
    last_error: ErrorCode,
    check_interval: u32,
    watch: Option<AddressBreak>,
    watch_seen: u32,
    watch_hit: bool,
}

impl<A: ArenaSource> ChunkHeap<A, NullSink> {
    /// Heap that discards its events.
    pub fn new(arena: A, flags: DebugFlags) -> Self {
        Self::with_sink(
            arena,
            NullSink,
            HeapConfig {
                flags,
                ..HeapConfig::default()
            },
        )
    }
}

impl<A: ArenaSource, S: EventSink> ChunkHeap<A, S> {
    pub fn with_sink(arena: A, sink: S, config: HeapConfig) -> Self {
        Self {
            blocks: Blocks::new(arena, config.seed),
            sink,
            flags: config.flags,
            stats: HeapStats::default(),
            iteration: 0,
            last_error: ErrorCode::None,
            check_interval: config.check_interval.unwrap_or(1).max(1),
            watch: config.watch,
            watch_seen: 0,
            watch_hit: false,
        }
    }

    #[must_use]
    pub fn flags(&self) -> DebugFlags {
        self.flags
    }

    /// Replaces the flags; they take effect on the next operation.
    pub fn set_flags(&mut self, flags: DebugFlags) {
        self.flags = flags;
    }

    pub fn set_check_interval(&mut self, interval: Option<u32>) {
        self.check_interval = interval.unwrap_or(1).max(1);
    }

    pub fn set_watch(&mut self, watch: Option<AddressBreak>) {
        self.watch = watch;
        self.watch_seen = 0;
    }

    /// Iteration counter; pass it to [`Self::log_changed`] as a mark.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// True once after the watched address was seen.
    pub fn take_watch_hit(&mut self) -> bool {
        core::mem::take(&mut self.watch_hit)
    }

    #[must_use]
    pub fn arena(&self) -> &A {
        &self.blocks.arena
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// True when `ptr` lies inside memory this heap handed out or manages.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let (start, end) = self.blocks.arena.bounds();
        (start..end).contains(&(ptr as usize))
    }

    /// Errors that the embedding layer must escalate to its fatal handler.
    #[must_use]
    pub fn should_abort(&self, err: &ChunkError) -> bool {
        err.is_fatal()
            || self.flags.contains(DebugFlags::ERROR_ABORT)
            || (matches!(err, ChunkError::ArenaExhausted(_))
                && self.flags.contains(DebugFlags::CATCH_NULL))
    }

    /// Allocates `size` bytes.
    pub fn allocate(&mut self, size: usize, site: CallSite) -> Result<NonNull<u8>, ChunkError> {
        self.stats.count_call(AllocKind::Malloc);
        self.run("malloc", |heap| heap.alloc_block(size, site, false, false))
    }

    /// Allocates `count * size` zeroed bytes.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, ChunkError> {
        self.stats.count_call(AllocKind::Calloc);
        self.run("calloc", |heap| {
            let total = count.checked_mul(size).ok_or(ChunkError::TooBig {
                size: usize::MAX,
                limit: LARGEST_ALLOCATION,
            })?;
            heap.alloc_block(total, site, true, false)
        })
    }

    /// Allocates `size` bytes aligned to `alignment`, a power of two no
    /// larger than the block size.
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        alignment: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, ChunkError> {
        self.stats.count_call(AllocKind::Memalign);
        self.run("memalign", |heap| {
            if !alignment.is_power_of_two() || alignment > BLOCK_SIZE {
                return Err(ChunkError::BadAlignment(alignment));
            }
            heap.alloc_block(size, site, false, alignment > ALLOCATION_ALIGNMENT)
        })
    }

    /// Allocates `size` bytes starting on a block boundary.
    pub fn allocate_block_aligned(
        &mut self,
        size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, ChunkError> {
        self.stats.count_call(AllocKind::Valloc);
        self.run("valloc", |heap| heap.alloc_block(size, site, false, true))
    }

    /// Releases a pointer returned by one of the allocate calls.
    pub fn release(&mut self, ptr: *mut u8, site: CallSite) -> Result<(), ChunkError> {
        self.stats.calls.free += 1;
        self.run("free", |heap| heap.release_block(ptr, site))
    }

    /// Changes the size of an allocation, in place when the reservation
    /// allows. Returns `None` when a zero-size resize released the block.
    pub fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, ChunkError> {
        self.stats.calls.realloc += 1;
        self.run("realloc", |heap| heap.resize_block(ptr, new_size, site))
    }

    /// Details of the live allocation starting at `ptr`.
    pub fn read_info(&self, ptr: *const u8) -> Result<AllocationInfo, ChunkError> {
        let mut update = UpdateRefs::new();
        let (id, info) = self.locate(ptr as usize, &mut update)?;
        Ok(self.describe(id, info))
    }

    /// Looks up a live allocation by user pointer (`exact`) or by any
    /// address inside its reservation.
    pub fn find(&self, addr: usize, exact: bool) -> Result<AllocationInfo, ChunkError> {
        if exact {
            let mut update = UpdateRefs::new();
            let (id, info) = self.locate(addr, &mut update)?;
            return Ok(self.describe(id, info));
        }
        let mut update = UpdateRefs::new();
        let store = &self.blocks.store;
        let id = self
            .blocks
            .used
            .find_address(store, addr, false, &mut update)
            .filter(|id| store.header(*id).flags.contains(SlotFlags::USER))
            .ok_or(ChunkError::NotFound(addr))?;
        let info = self.layout(id);
        Ok(self.describe(id, info))
    }

    /// Checks that `ptr`, handed to a memory routine named `func`, is either
    /// foreign to the heap or inside a live allocation with `min_size` bytes
    /// left. With `exact`, `ptr` must be the allocation's start.
    pub fn check_pointer(
        &mut self,
        func: &'static str,
        ptr: *const u8,
        exact: bool,
        min_size: usize,
    ) -> Result<(), ChunkError> {
        let res = self.pointer_fits(ptr as usize, exact, min_size);
        self.track(func, res)
    }

    /// Runs the heap validator.
    pub fn heap_check(&mut self) -> Result<(), ChunkError> {
        let res = self.validate();
        self.track("heap-check", res)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let counts = self.blocks.counts;
        HeapStats {
            user_blocks: counts.user,
            admin_blocks: counts.admin,
            extern_blocks: counts.external,
            free_bytes: counts.free_bytes,
            ..self.stats
        }
    }

    /// Live user allocations in address order.
    pub fn live(&self) -> impl Iterator<Item = AllocationInfo> + '_ {
        let store = &self.blocks.store;
        self.blocks
            .used
            .iter(store)
            .filter(move |id| store.header(*id).flags.contains(SlotFlags::USER))
            .map(move |id| self.describe(id, self.layout(id)))
    }

    /// Free-size index entries in size order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        let store = &self.blocks.store;
        self.blocks.free.iter(store).map(move |id| {
            let header = store.header(id);
            FreeBlock {
                mem: header.mem,
                size: header.total_size,
            }
        })
    }

    /// Mutable view of a live allocation's user bytes.
    pub fn user_bytes_mut(&mut self, ptr: NonNull<u8>) -> Result<&mut [u8], ChunkError> {
        let mut update = UpdateRefs::new();
        let (_, info) = self.locate(ptr.as_ptr() as usize, &mut update)?;
        // SAFETY: the user region belongs to a live allocation and the
        // returned borrow keeps the heap from touching it.
        Ok(unsafe { fence::bytes_mut(info.user_start, info.user_size()) })
    }

    /// Shared view of a live allocation's user bytes.
    pub fn user_bytes(&self, ptr: NonNull<u8>) -> Result<&[u8], ChunkError> {
        let mut update = UpdateRefs::new();
        let (_, info) = self.locate(ptr.as_ptr() as usize, &mut update)?;
        // SAFETY: as in `user_bytes_mut`, for a shared borrow.
        Ok(unsafe { fence::bytes(info.user_start, info.user_size()) })
    }

    /// Writes the statistics summary to the event sink.
    pub fn log_stats(&mut self) {
        let stats = self.stats();
        let (start, end) = self.blocks.arena.bounds();
        let it = self.iteration;
        let sink = &mut self.sink;
        let loss = stats.rounding_loss();
        let loss_pct = if stats.given_current == 0 {
            0
        } else {
            loss * 100 / stats.given_current
        };
        let calls = stats.calls;
        emit(sink, it, format_args!("Dumping Chunk Statistics:"));
        emit(
            sink,
            it,
            format_args!(
                "basic-block {BLOCK_SIZE} bytes, alignment {ALLOCATION_ALIGNMENT} bytes, heap {start:#x} to {end:#x}, size {} bytes",
                end - start
            ),
        );
        emit(
            sink,
            it,
            format_args!(
                "    alloc calls: malloc {}, calloc {}, realloc {}, free {}",
                calls.malloc, calls.calloc, calls.realloc, calls.free
            ),
        );
        emit(
            sink,
            it,
            format_args!(
                "    alloc calls: memalign {}, valloc {}",
                calls.memalign, calls.valloc
            ),
        );
        emit(
            sink,
            it,
            format_args!(
                "  total memory allocated: {} bytes ({} pnts)",
                stats.alloc_total, stats.pointers_total
            ),
        );
        emit(
            sink,
            it,
            format_args!(
                "  max in use at one time: {} bytes ({} pnts)",
                stats.alloc_max, stats.pointers_max
            ),
        );
        emit(
            sink,
            it,
            format_args!("max alloced with 1 call: {} bytes", stats.alloc_one_max),
        );
        emit(
            sink,
            it,
            format_args!("max alloc rounding loss: {loss} bytes ({loss_pct}%)"),
        );
        emit(
            sink,
            it,
            format_args!(
                "   total memory in use: {} bytes ({} pnts)",
                stats.alloc_current, stats.pointers_current
            ),
        );
        emit(
            sink,
            it,
            format_args!(
                "  user blocks {}, admin blocks {}, external blocks {}, free bytes {}",
                stats.user_blocks, stats.admin_blocks, stats.extern_blocks, stats.free_bytes
            ),
        );
        let blocks = &self.blocks;
        let spare: usize = (0..MAX_SKIP_LEVEL)
            .map(|level| blocks.entries.free_count(level))
            .sum();
        emit(
            sink,
            it,
            format_args!(
                "  entry blocks {}, spare slots {spare}, used index {}, free index {}",
                blocks.entries.block_count(),
                blocks.used.len(),
                blocks.free.len()
            ),
        );
    }

    /// Reports allocations touched after iteration `mark`: live ones with
    /// `not_freed`, released ones with `freed`. Without `details` each call
    /// site is summarized on one line.
    pub fn log_changed(&mut self, mark: u64, not_freed: bool, freed: bool, details: bool) {
        let log_unknown = self.flags.contains(DebugFlags::LOG_UNKNOWN);
        let it = self.iteration;
        let blocks = &self.blocks;
        let sink = &mut self.sink;
        let sections = [(not_freed, "not freed", false), (freed, "freed", true)];
        for (enabled, label, released) in sections {
            if !enabled {
                continue;
            }
            if mark == 0 {
                emit(
                    sink,
                    it,
                    format_args!("Dumping {label} pointers changed since start:"),
                );
            } else {
                emit(
                    sink,
                    it,
                    format_args!("Dumping {label} pointers changed since mark {mark}:"),
                );
            }
            let store = &blocks.store;
            let slots = move || changed_slots(blocks, released, mark);
            let (mut known, mut known_bytes) = (0usize, 0usize);
            let (mut unknown, mut unknown_bytes) = (0usize, 0usize);
            for (n, id) in slots().enumerate() {
                let header = store.header(id);
                let size = header.user_size;
                if header.site.is_known() {
                    known += 1;
                    known_bytes += size;
                } else {
                    unknown += 1;
                    unknown_bytes += size;
                    if !log_unknown {
                        continue;
                    }
                }
                let site = header.site;
                if details {
                    let ptr =
                        PointerInfo::compute(header.mem, header.total_size, size, header.flags)
                            .user_start;
                    emit(
                        sink,
                        it,
                        format_args!(
                            " {label}: '{ptr:#x}|s{}' ({size} bytes) from '{site}'",
                            header.use_iter
                        ),
                    );
                    continue;
                }
                if slots().take(n).any(|other| store.header(other).site == site) {
                    continue;
                }
                let (count, bytes) = slots()
                    .map(|other| store.header(other))
                    .filter(|other| other.site == site)
                    .fold((0usize, 0usize), |(c, b), other| (c + 1, b + other.user_size));
                emit(
                    sink,
                    it,
                    format_args!(" {label}: {count} pointers, {bytes} bytes from '{site}'"),
                );
            }
            emit(
                sink,
                it,
                format_args!(" known memory: {known} pointers, {known_bytes} bytes"),
            );
            if log_unknown {
                emit(
                    sink,
                    it,
                    format_args!(" unknown memory: {unknown} pointers, {unknown_bytes} bytes"),
                );
            }
        }
    }

    fn event(&mut self, args: fmt::Arguments<'_>) {
        emit(&mut self.sink, self.iteration, args);
    }

    fn run<T>(
        &mut self,
        func: &'static str,
        op: impl FnOnce(&mut Self) -> Result<T, ChunkError>,
    ) -> Result<T, ChunkError> {
        self.iteration += 1;
        self.blocks.blank = BlankPolicy {
            fill_fresh: self.flags.contains(DebugFlags::FREE_BLANK)
                || self.flags.contains(DebugFlags::CHECK_BLANK),
            check_reuse: self.flags.contains(DebugFlags::CHECK_BLANK),
        };
        let res = if self.flags.contains(DebugFlags::CHECK_HEAP)
            && self.iteration % u64::from(self.check_interval) == 0
        {
            self.validate().and_then(|()| op(self))
        } else {
            op(self)
        };
        self.track(func, res)
    }

    fn track<T>(
        &mut self,
        func: &'static str,
        res: Result<T, ChunkError>,
    ) -> Result<T, ChunkError> {
        if let Err(err) = &res {
            self.last_error = err.code();
            self.report(func, err);
        }
        res
    }

    fn report(&mut self, func: &'static str, err: &ChunkError) {
        let code = err.code().code();
        self.event(format_args!("ERROR: {func}: {err} (err {code})"));
        if let ChunkError::Fence { side, addr } = *err {
            if self.flags.contains(DebugFlags::LOG_BAD_SPACE) {
                self.dump_fence(side, addr);
            }
        }
    }

    fn dump_fence(&mut self, side: FenceSide, addr: usize) {
        let mut update = UpdateRefs::new();
        let Some(id) = self
            .blocks
            .used
            .find_address(&self.blocks.store, addr, false, &mut update)
        else {
            return;
        };
        let info = self.layout(id);
        let shown = DUMP_SPACE.min(info.user_size());
        let (start, end) = match side {
            FenceSide::Bottom => (info.fence_bottom, info.user_start + shown),
            FenceSide::Top => (info.user_bounds - shown, info.fence_top + FENCE_TOP_SIZE),
        };
        // SAFETY: both ranges lie inside the block's reservation.
        let view = unsafe { fence::bytes(start, end - start) };
        emit(
            &mut self.sink,
            self.iteration,
            format_args!("  dump of {side} fence region at {start:#x}: '{}'", ByteDump(view)),
        );
    }

    fn watch_pointer(&mut self, addr: usize, func: &'static str) {
        let Some(watch) = self.watch else {
            return;
        };
        if watch.addr != addr {
            return;
        }
        self.watch_seen += 1;
        let seen = self.watch_seen;
        if watch.count.is_none_or(|count| count == seen) {
            self.watch_hit = true;
            self.event(format_args!("address {addr:#x} seen {seen} times in {func}"));
        }
    }

    fn layout(&self, id: SlotId) -> PointerInfo {
        let header = self.blocks.store.header(id);
        PointerInfo::compute(header.mem, header.total_size, header.user_size, header.flags)
    }

    fn describe(&self, id: SlotId, info: PointerInfo) -> AllocationInfo {
        let header = self.blocks.store.header(id);
        AllocationInfo {
            pointer: info.user_start,
            user_size: header.user_size,
            total_size: header.total_size,
            site: header.site,
            fenced: info.fenced,
            aligned: info.aligned,
            use_iter: header.use_iter,
            layout: info,
        }
    }

    /// Resolves a user pointer to its slot and validates the slot. Any
    /// inconsistency is reported as not found; damaged fences as fence errors.
    fn locate(
        &self,
        addr: usize,
        update: &mut UpdateRefs,
    ) -> Result<(SlotId, PointerInfo), ChunkError> {
        let store = &self.blocks.store;
        let id = self
            .blocks
            .used
            .find_address(store, addr, false, update)
            .ok_or(ChunkError::NotFound(addr))?;
        let header = store.header(id);
        if !header.flags.contains(SlotFlags::USER) {
            return Err(ChunkError::NotFound(addr));
        }
        let info = self.layout(id);
        if info.user_start != addr
            || header.user_size > info.capacity()
            || !header.site.is_consistent()
            || (info.aligned && addr % BLOCK_SIZE != 0)
        {
            return Err(ChunkError::NotFound(addr));
        }
        // SAFETY: fences of a live block lie inside its reservation.
        unsafe { fence::check_fences(&info) }.map_err(|side| ChunkError::Fence { side, addr })?;
        Ok((id, info))
    }

    fn blank_alloc(&self) -> bool {
        self.flags.contains(DebugFlags::ALLOC_BLANK) || self.flags.contains(DebugFlags::CHECK_BLANK)
    }

    fn blank_free(&self) -> bool {
        self.flags.contains(DebugFlags::FREE_BLANK) || self.flags.contains(DebugFlags::CHECK_BLANK)
    }

    fn alloc_block(
        &mut self,
        size: usize,
        site: CallSite,
        zero: bool,
        aligned: bool,
    ) -> Result<NonNull<u8>, ChunkError> {
        if size == 0 && !self.flags.contains(DebugFlags::ALLOW_ZERO) {
            return Err(ChunkError::BadSize(0));
        }
        if size > LARGEST_ALLOCATION {
            return Err(ChunkError::TooBig {
                size,
                limit: LARGEST_ALLOCATION,
            });
        }
        let fenced = self.flags.contains(DebugFlags::CHECK_FENCE);
        let mut slot_flags = SlotFlags::USER;
        if fenced {
            slot_flags = slot_flags | SlotFlags::FENCE;
        }
        if aligned {
            slot_flags = slot_flags | SlotFlags::VALLOC;
        }
        let total = size + fence::overhead(fenced, aligned);

        let mut log = Gated::new(&mut self.sink, self.flags.contains(DebugFlags::LOG_ADMIN));
        let id = match self.blocks.get_memory(total, slot_flags, &mut log)? {
            Taken::Slot(id) => id,
            Taken::Dirty(addr) => return Err(ChunkError::FreeNonBlank { addr }),
        };

        let header = self.blocks.store.header_mut(id);
        header.user_size = size;
        header.site = site;
        header.use_iter = self.iteration;
        let info = PointerInfo::compute(header.mem, header.total_size, size, header.flags);
        // SAFETY: `info` describes the block just reserved for this call.
        unsafe {
            if self.blank_alloc() {
                fence::fill(info.alloc_start, info.alloc_bounds, ALLOC_BLANK_CHAR);
            }
            if zero {
                fence::fill(info.user_start, info.user_bounds, 0);
            }
            fence::write_fences(&info);
        }
        self.stats
            .record_alloc(size, info.alloc_bounds - info.alloc_start);
        if self.flags.contains(DebugFlags::LOG_TRANS) {
            let ptr = info.user_start;
            self.event(format_args!("alloc: {size} bytes got {ptr:#x} from '{site}'"));
        }
        self.watch_pointer(info.user_start, "alloc");
        user_ptr(&info)
    }

    fn release_block(&mut self, ptr: *mut u8, site: CallSite) -> Result<(), ChunkError> {
        if ptr.is_null() {
            if self.flags.contains(DebugFlags::ERROR_FREE_NULL) {
                return Err(ChunkError::FreeNull);
            }
            if self.flags.contains(DebugFlags::LOG_TRANS) {
                self.event(format_args!("WARNING: free: null pointer from '{site}'"));
            }
            return Ok(());
        }
        let addr = ptr as usize;
        let mut update = UpdateRefs::new();
        let (id, info) = self.locate(addr, &mut update)?;
        let user_size = info.user_size();
        self.stats
            .record_free(user_size, info.alloc_bounds - info.alloc_start);
        if self.flags.contains(DebugFlags::LOG_TRANS) {
            self.event(format_args!("free: {user_size} bytes at {addr:#x} from '{site}'"));
        }
        self.watch_pointer(addr, "free");

        let blanked = self.blank_free();
        if blanked {
            // SAFETY: the block is being released; nobody may use it now.
            unsafe { fence::fill(info.alloc_start, info.alloc_bounds, FREE_BLANK_CHAR) };
        }
        let iteration = self.iteration;
        let header = self.blocks.store.header_mut(id);
        header.site = site;
        header.use_iter = iteration;
        if self.flags.contains(DebugFlags::NEVER_REUSE) {
            self.blocks.retire(id, blanked);
            Ok(())
        } else {
            self.blocks.release_to_free(id, &update, blanked)
        }
    }

    fn resize_block(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, ChunkError> {
        if ptr.is_null() {
            return self.alloc_block(new_size, site, false, false).map(Some);
        }
        if new_size == 0 && !self.flags.contains(DebugFlags::ALLOW_ZERO) {
            self.release_block(ptr, site)?;
            return Ok(None);
        }
        if new_size > LARGEST_ALLOCATION {
            return Err(ChunkError::TooBig {
                size: new_size,
                limit: LARGEST_ALLOCATION,
            });
        }

        let addr = ptr as usize;
        let mut update = UpdateRefs::new();
        let (id, info) = self.locate(addr, &mut update)?;
        let old_size = info.user_size();
        let always_copy = self.flags.contains(DebugFlags::REALLOC_COPY)
            || self.flags.contains(DebugFlags::NEVER_REUSE);

        if !always_copy && new_size <= info.capacity() {
            let resized = info.resized(new_size);
            let top = if info.fenced { FENCE_TOP_SIZE } else { 0 };
            let blank = self.blank_alloc();
            // SAFETY: every range lies inside the block's reservation.
            unsafe {
                if new_size > old_size {
                    let fill_byte = if blank { ALLOC_BLANK_CHAR } else { 0 };
                    fence::fill(info.user_bounds, resized.user_bounds, fill_byte);
                } else if blank {
                    fence::fill(resized.user_bounds, info.user_bounds + top, ALLOC_BLANK_CHAR);
                }
                fence::write_fences(&resized);
            }
            let iteration = self.iteration;
            let header = self.blocks.store.header_mut(id);
            header.user_size = new_size;
            header.site = site;
            header.use_iter = iteration;
            self.stats.record_resize(old_size, new_size);
            if self.flags.contains(DebugFlags::LOG_TRANS) {
                self.event(format_args!(
                    "realloc: {addr:#x} from {old_size} to {new_size} bytes in place from '{site}'"
                ));
            }
            return Ok(Some(ptr_nonnull(ptr)?));
        }

        let fresh = self.alloc_block(new_size, site, false, info.aligned)?;
        // SAFETY: both blocks are live, distinct, and at least this long.
        unsafe {
            core::ptr::copy_nonoverlapping(
                addr as *const u8,
                fresh.as_ptr(),
                old_size.min(new_size),
            );
        }
        self.release_block(ptr, site)?;
        if self.flags.contains(DebugFlags::LOG_TRANS) {
            let to = fresh.as_ptr() as usize;
            self.event(format_args!(
                "realloc: {addr:#x} moved to {to:#x} for {new_size} bytes from '{site}'"
            ));
        }
        Ok(Some(fresh))
    }

    fn pointer_fits(&self, addr: usize, exact: bool, min_size: usize) -> Result<(), ChunkError> {
        if !self.contains(addr as *const u8) {
            return Ok(());
        }
        let mut update = UpdateRefs::new();
        let store = &self.blocks.store;
        let id = self
            .blocks
            .used
            .find_address(store, addr, false, &mut update)
            .filter(|id| store.header(*id).flags.contains(SlotFlags::USER))
            .ok_or(ChunkError::NotFound(addr))?;
        let info = self.layout(id);
        if (exact && addr != info.user_start) || addr < info.user_start || addr > info.user_bounds {
            return Err(ChunkError::NotFound(addr));
        }
        if min_size > info.user_bounds - addr {
            return Err(ChunkError::WouldOverwrite {
                addr,
                needed: min_size,
            });
        }
        // SAFETY: fences of a live block lie inside its reservation.
        unsafe { fence::check_fences(&info) }.map_err(|side| ChunkError::Fence {
            side,
            addr: info.user_start,
        })
    }

    fn validate(&self) -> Result<(), ChunkError> {
        let blocks = &self.blocks;
        let store = &blocks.store;
        let all_levels = self.flags.contains(DebugFlags::CHECK_LISTS);
        let check_blank = self.flags.contains(DebugFlags::CHECK_BLANK);
        blocks.entries.check_blocks()?;
        blocks.used.check(store, all_levels)?;
        blocks.free.check(store, all_levels)?;

        let (lo, hi) = blocks.arena.bounds();
        let inside = |mem: usize, size: usize| mem >= lo && mem.saturating_add(size) <= hi;
        let blank_ok = |mem: usize, size: usize| {
            // SAFETY: free and retired blocks are heap memory no user holds.
            match unsafe { fence::first_mismatch(mem, mem + size, FREE_BLANK_CHAR) } {
                Some(addr) => Err(ChunkError::FreeNonBlank { addr }),
                None => Ok(()),
            }
        };

        for id in blocks.used.iter(store) {
            let header = store.header(id);
            let flags = header.flags;
            if !inside(header.mem, header.total_size) {
                return Err(Corruption::OutsideArena(header.mem).into());
            }
            if !flags.has_single_state() || flags.contains(SlotFlags::FREE) {
                return Err(Corruption::BadFlags(header.mem).into());
            }
            if flags.contains(SlotFlags::USER) {
                let info = self.layout(id);
                if header.user_size > info.capacity() || !header.site.is_consistent() {
                    return Err(Corruption::BadFlags(header.mem).into());
                }
                // SAFETY: fences of a live block lie inside its reservation.
                unsafe { fence::check_fences(&info) }.map_err(|side| ChunkError::Fence {
                    side,
                    addr: info.user_start,
                })?;
            }
            if check_blank
                && flags.contains(SlotFlags::RETIRED)
                && flags.contains(SlotFlags::BLANK)
            {
                blank_ok(header.mem, header.total_size)?;
            }
        }

        for id in blocks.free.iter(store) {
            let header = store.header(id);
            if !inside(header.mem, header.total_size) {
                return Err(Corruption::OutsideArena(header.mem).into());
            }
            if !header.flags.contains(SlotFlags::FREE) || !header.flags.has_single_state() {
                return Err(Corruption::NotFree(header.mem).into());
            }
            if check_blank && header.flags.contains(SlotFlags::BLANK) {
                blank_ok(header.mem, header.total_size)?;
            }
        }
        Ok(())
    }
}

fn ptr_nonnull(ptr: *mut u8) -> Result<NonNull<u8>, ChunkError> {
    NonNull::new(ptr).ok_or(ChunkError::NotFound(0))
}

/// Slots touched after `mark`: live user blocks, or released ones.
fn changed_slots<A: ArenaSource>(
    blocks: &Blocks<A>,
    released: bool,
    mark: u64,
) -> impl Iterator<Item = SlotId> + '_ {
    let store = &blocks.store;
    blocks
        .used
        .iter(store)
        .chain(blocks.free.iter(store))
        .filter(move |id| {
            let header = store.header(*id);
            let state = if released {
                header.flags.contains(SlotFlags::FREE) || header.flags.contains(SlotFlags::RETIRED)
            } else {
                header.flags.contains(SlotFlags::USER)
            };
            state && header.use_iter > mark
        })
}
