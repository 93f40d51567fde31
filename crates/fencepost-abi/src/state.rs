//! The process-wide heap behind the C entry points.
//!
//! One [`ChunkHeap`] over an [`MmapArena`] sits in a `parking_lot::Mutex`,
//! created on first use from the resolved options. Callers that cannot use
//! it (options still resolving, arena reservation failed) get `None` and
//! fall back to the native allocator.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use fencepost_core::{ChunkError, ChunkHeap, DebugFlags, ErrorCode, EventSink, HeapConfig};
use parking_lot::{Mutex, MutexGuard};

use crate::config::{self, Settings};
use crate::fatal;
use crate::log_sink::FdSink;
use crate::mmap_arena::{DEFAULT_RESERVE, MmapArena};

pub type AbiHeap = ChunkHeap<MmapArena, FdSink>;

const HEAP_UNINIT: u8 = 0;
const HEAP_READY: u8 = 1;
const HEAP_DISABLED: u8 = 2;

static HEAP: Mutex<Option<AbiHeap>> = Mutex::new(None);
static HEAP_STATE: AtomicU8 = AtomicU8::new(HEAP_UNINIT);
static LAST_ERROR: AtomicU32 = AtomicU32::new(0);
static COUNTERS: AbiCounters = AbiCounters::new();

/// Seed for skip levels; fixed so runs are reproducible.
const LEVEL_SEED: u64 = 0xF3AC_E905_7000_0001;

/// Entry-point counters kept outside the heap lock.
pub struct AbiCounters {
    /// Calls routed to the debugging heap.
    pub heap_calls: AtomicU64,
    /// Calls served by the native allocator (reentry, bootstrap, disabled heap).
    pub native_calls: AtomicU64,
    /// Releases and resizes of pointers the heap does not own.
    pub foreign_pointers: AtomicU64,
    /// Calls that returned an error.
    pub errors: AtomicU64,
}

/// Plain copy of [`AbiCounters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AbiCountersSnapshot {
    pub heap_calls: u64,
    pub native_calls: u64,
    pub foreign_pointers: u64,
    pub errors: u64,
}

/// What an entry point observed, for [`AbiCounters::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiEvent {
    Heap,
    Native,
    Foreign,
    Error,
}

impl AbiCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_calls: AtomicU64::new(0),
            native_calls: AtomicU64::new(0),
            foreign_pointers: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: AbiEvent) {
        let counter = match event {
            AbiEvent::Heap => &self.heap_calls,
            AbiEvent::Native => &self.native_calls,
            AbiEvent::Foreign => &self.foreign_pointers,
            AbiEvent::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> AbiCountersSnapshot {
        AbiCountersSnapshot {
            heap_calls: self.heap_calls.load(Ordering::Relaxed),
            native_calls: self.native_calls.load(Ordering::Relaxed),
            foreign_pointers: self.foreign_pointers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for AbiCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn counters() -> &'static AbiCounters {
    &COUNTERS
}

/// Code of the most recent error of any thread.
#[must_use]
pub fn last_error() -> ErrorCode {
    ErrorCode::from_code(LAST_ERROR.load(Ordering::Relaxed)).unwrap_or(ErrorCode::None)
}

fn build(settings: &Settings) -> Result<AbiHeap, ChunkError> {
    let arena = MmapArena::reserve(DEFAULT_RESERVE)?;
    let mut sink = FdSink::open(settings.log_path.as_c_str());
    sink.configure(settings.flags);
    let mut heap = ChunkHeap::with_sink(
        arena,
        sink,
        HeapConfig {
            flags: settings.flags,
            seed: LEVEL_SEED,
            check_interval: settings.interval,
            watch: settings.watch,
        },
    );
    if settings.rejected {
        heap.sink_mut().record(format_args!(
            "WARNING: {} could not be parsed; using defaults",
            config::OPTIONS_ENV.to_string_lossy()
        ));
    }
    Ok(heap)
}

extern "C" fn report_at_exit() {
    let Some(_guard) = crate::reentry::enter() else {
        return;
    };
    let Some(mut slot) = HEAP.try_lock() else {
        return;
    };
    let Some(heap) = slot.as_mut() else {
        return;
    };
    let flags = config::flags();
    heap.set_flags(flags);
    heap.sink_mut().configure(flags);
    if flags.contains(DebugFlags::LOG_STATS) {
        heap.log_stats();
    }
    if flags.contains(DebugFlags::LOG_NON_FREE) {
        heap.log_changed(0, true, false, true);
    }
}

fn lock(lock_on: u32) -> MutexGuard<'static, Option<AbiHeap>> {
    for _ in 0..lock_on {
        if let Some(guard) = HEAP.try_lock() {
            return guard;
        }
        std::hint::spin_loop();
    }
    HEAP.lock()
}

/// Runs `op` on the global heap, creating it on first use.
///
/// Returns `None` when the heap is unavailable. Errors are recorded as the
/// last error; fatal ones (and all of them under error-abort) end the
/// process here and never reach the caller.
pub fn with_heap<T>(
    func: &'static str,
    op: impl FnOnce(&mut AbiHeap) -> Result<T, ChunkError>,
) -> Option<Result<T, ChunkError>> {
    if HEAP_STATE.load(Ordering::Acquire) == HEAP_DISABLED {
        return None;
    }
    let settings = config::settings()?;
    let mut slot = lock(settings.lock_on);
    if slot.is_none() {
        if HEAP_STATE.load(Ordering::Acquire) == HEAP_DISABLED {
            return None;
        }
        match build(&settings) {
            Ok(heap) => {
                *slot = Some(heap);
                HEAP_STATE.store(HEAP_READY, Ordering::Release);
                // SAFETY: registering a plain extern "C" function.
                unsafe { libc::atexit(report_at_exit) };
            }
            Err(_) => {
                HEAP_STATE.store(HEAP_DISABLED, Ordering::Release);
                return None;
            }
        }
    }
    let heap = slot.as_mut()?;

    let flags = settings.flags;
    if heap.flags() != flags {
        heap.set_flags(flags);
    }
    heap.sink_mut().configure(flags);
    COUNTERS.record(AbiEvent::Heap);

    let res = op(heap);
    if let Err(err) = &res {
        COUNTERS.record(AbiEvent::Error);
        LAST_ERROR.store(err.code().code(), Ordering::Relaxed);
        if heap.should_abort(err) {
            fatal::die(heap.sink_mut(), flags, func, err);
        }
    }
    if heap.take_watch_hit() && flags.contains(DebugFlags::ERROR_ABORT) {
        let addr = settings.watch.map_or(0, |w| w.addr);
        heap.sink_mut()
            .record(format_args!("watched address {addr:#x} reached in {func}"));
        fatal::die(heap.sink_mut(), flags, func, &ChunkError::NotFound(addr));
    }
    Some(res)
}

/// Whether the heap has been created and is serving calls.
#[must_use]
pub fn is_ready() -> bool {
    HEAP_STATE.load(Ordering::Acquire) == HEAP_READY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let counters = AbiCounters::new();
        counters.record(AbiEvent::Heap);
        counters.record(AbiEvent::Heap);
        counters.record(AbiEvent::Foreign);
        assert_eq!(
            counters.snapshot(),
            AbiCountersSnapshot {
                heap_calls: 2,
                native_calls: 0,
                foreign_pointers: 1,
                errors: 0,
            }
        );
    }

    #[test]
    fn global_sink_accepts_events() {
        let res = with_heap("fencepost_log", |heap| {
            heap.sink_mut()
                .record(format_args!("event from {}", "state test"));
            Ok(heap.iteration())
        });
        assert!(matches!(res, Some(Ok(_))));
    }

    #[test]
    fn global_heap_serves_and_records_errors() {
        let ptr = with_heap("malloc", |heap| {
            heap.allocate(24, fencepost_core::CallSite::caller())
        })
        .expect("heap should be available")
        .unwrap();
        assert!(is_ready());
        let again = with_heap("free", |heap| {
            heap.release(ptr.as_ptr(), fencepost_core::CallSite::caller())?;
            heap.release(ptr.as_ptr(), fencepost_core::CallSite::caller())
        })
        .unwrap();
        assert_eq!(again, Err(ChunkError::NotFound(ptr.as_ptr() as usize)));
        assert_eq!(last_error(), ErrorCode::NotFound);
        assert!(counters().snapshot().errors >= 1);
    }
}
