//! Randomized allocation workload against an in-process heap.
//!
//! Each run drives a [`ChunkHeap`] over a [`ReservedArena`] with a seeded
//! xorshift sequence of allocate, resize and release calls. Every live block
//! is filled with a per-allocation byte pattern that is verified before the
//! block is resized or released, and the heap validator runs at a fixed
//! interval. The trace of operations, with pointers taken relative to the
//! arena base, is folded into a SHA-256 digest so two runs with the same seed
//! and flags can be compared.

use std::io::Write;
use std::ptr::NonNull;
use std::time::Instant;

use fencepost_core::constants::BLOCK_SIZE;
use fencepost_core::{ArenaSource, CallSite, ChunkHeap, DebugFlags, HeapStats, ReservedArena};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TortureConfig {
    pub seed: u64,
    pub iterations: u64,
    pub max_live: usize,
    pub max_size: usize,
    pub flags: DebugFlags,
    pub arena_bytes: usize,
    /// Heap validation interval in operations; 0 validates only at the end.
    pub check_every: u64,
}

impl Default for TortureConfig {
    fn default() -> Self {
        Self {
            seed: 0xF3AC_E905,
            iterations: 10_000,
            max_live: 256,
            max_size: 3 * BLOCK_SIZE,
            flags: DebugFlags::CHECK_FENCE | DebugFlags::FREE_BLANK | DebugFlags::ALLOC_BLANK,
            arena_bytes: 256 << 20,
            check_every: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TortureReport {
    pub seed: u64,
    pub iterations: u64,
    pub allocs: u64,
    pub resizes: u64,
    pub frees: u64,
    pub peak_live: usize,
    pub checks: u64,
    /// Hex SHA-256 of the operation trace.
    pub digest: String,
    pub stats: HeapStats,
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound.max(1) as u64) as usize
    }
}

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    pattern: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Malloc,
    Calloc,
    Memalign,
    Resize,
    Free,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Memalign => "memalign",
            Self::Resize => "realloc",
            Self::Free => "free",
        }
    }
}

struct Run<'e, W: Write> {
    heap: ChunkHeap<ReservedArena>,
    rng: XorShift64,
    live: Vec<Live>,
    hasher: Sha256,
    base: usize,
    max_size: usize,
    emitter: Option<&'e mut LogEmitter<W>>,
    report: TortureReport,
}

fn fill(
    heap: &mut ChunkHeap<ReservedArena>,
    ptr: NonNull<u8>,
    pattern: u8,
) -> Result<(), HarnessError> {
    heap.user_bytes_mut(ptr)?.fill(pattern);
    Ok(())
}

fn pattern_holds(
    heap: &ChunkHeap<ReservedArena>,
    live: &Live,
    len: usize,
) -> Result<bool, HarnessError> {
    let bytes = heap.user_bytes(live.ptr)?;
    Ok(bytes[..len.min(bytes.len())].iter().all(|b| *b == live.pattern))
}

impl<W: Write> Run<'_, W> {
    fn trace(
        &mut self,
        iter: u64,
        op: Op,
        size: usize,
        ptr: Option<NonNull<u8>>,
    ) -> Result<(), HarnessError> {
        let offset = ptr.map_or(0, |p| p.as_ptr() as usize - self.base);
        self.hasher
            .update(format!("{iter}:{}:{size}:{offset:#x}\n", op.name()).as_bytes());
        if let Some(emitter) = self.emitter.as_deref_mut() {
            let mut entry = LogEntry::event(LogLevel::Debug, "heap_op").with_op(op.name(), size);
            if let Some(p) = ptr {
                entry = entry.with_pointer(p.as_ptr() as usize);
            }
            emitter.emit_entry(entry)?;
        }
        Ok(())
    }

    fn size(&mut self) -> usize {
        // Mostly small requests, with an occasional multi-block one.
        if self.rng.below(8) == 0 {
            1 + self.rng.below(self.max_size)
        } else {
            1 + self.rng.below(BLOCK_SIZE / 4)
        }
    }

    fn step(&mut self, iter: u64, config: &TortureConfig) -> Result<(), HarnessError> {
        let torture = |source| HarnessError::Torture { op: iter, source };
        let roll = self.rng.below(10);
        let op = if self.live.is_empty() || (roll < 5 && self.live.len() < config.max_live) {
            match self.rng.below(4) {
                0 => Op::Calloc,
                1 => Op::Memalign,
                _ => Op::Malloc,
            }
        } else if roll < 7 {
            Op::Resize
        } else {
            Op::Free
        };

        match op {
            Op::Malloc | Op::Calloc | Op::Memalign => {
                let size = self.size();
                let site = CallSite::caller();
                let ptr = match op {
                    Op::Calloc => self.heap.allocate_zeroed(1, size, site),
                    Op::Memalign => self.heap.allocate_aligned(size, 64, site),
                    _ => self.heap.allocate(size, site),
                }
                .map_err(torture)?;
                if op == Op::Calloc && self.heap.user_bytes(ptr)?.iter().any(|b| *b != 0) {
                    return Err(HarnessError::DataMismatch {
                        op: iter,
                        addr: ptr.as_ptr() as usize,
                    });
                }
                let pattern = (self.rng.next_u64() as u8) | 1;
                fill(&mut self.heap, ptr, pattern)?;
                self.live.push(Live { ptr, size, pattern });
                self.report.allocs += 1;
                self.report.peak_live = self.report.peak_live.max(self.live.len());
                self.trace(iter, op, size, Some(ptr))
            }
            Op::Resize => {
                let idx = self.rng.below(self.live.len());
                let new_size = self.size();
                let old = &self.live[idx];
                if !pattern_holds(&self.heap, old, old.size)? {
                    return Err(HarnessError::DataMismatch {
                        op: iter,
                        addr: old.ptr.as_ptr() as usize,
                    });
                }
                let kept = old.size.min(new_size);
                let moved = self
                    .heap
                    .resize(old.ptr.as_ptr(), new_size, CallSite::caller())
                    .map_err(torture)?
                    .ok_or(HarnessError::DataMismatch {
                        op: iter,
                        addr: old.ptr.as_ptr() as usize,
                    })?;
                let entry = &mut self.live[idx];
                entry.ptr = moved;
                entry.size = new_size;
                if !pattern_holds(&self.heap, &self.live[idx], kept)? {
                    return Err(HarnessError::DataMismatch {
                        op: iter,
                        addr: moved.as_ptr() as usize,
                    });
                }
                let pattern = self.live[idx].pattern;
                fill(&mut self.heap, moved, pattern)?;
                self.report.resizes += 1;
                self.trace(iter, op, new_size, Some(moved))
            }
            Op::Free => {
                let idx = self.rng.below(self.live.len());
                let gone = self.live.swap_remove(idx);
                if !pattern_holds(&self.heap, &gone, gone.size)? {
                    return Err(HarnessError::DataMismatch {
                        op: iter,
                        addr: gone.ptr.as_ptr() as usize,
                    });
                }
                self.heap
                    .release(gone.ptr.as_ptr(), CallSite::caller())
                    .map_err(torture)?;
                self.report.frees += 1;
                self.trace(iter, op, gone.size, Some(gone.ptr))
            }
        }
    }
}

/// Runs the workload described by `config`, logging each operation to
/// `emitter` when given.
pub fn run<W: Write>(
    config: &TortureConfig,
    emitter: Option<&mut LogEmitter<W>>,
) -> Result<TortureReport, HarnessError> {
    let started = Instant::now();
    let arena = ReservedArena::new(config.arena_bytes)?;
    let base = arena.base();
    let mut run = Run {
        heap: ChunkHeap::new(arena, config.flags),
        rng: XorShift64::new(config.seed),
        live: Vec::with_capacity(config.max_live),
        hasher: Sha256::new(),
        base,
        emitter,
        max_size: config.max_size.max(1),
        report: TortureReport {
            seed: config.seed,
            iterations: config.iterations,
            allocs: 0,
            resizes: 0,
            frees: 0,
            peak_live: 0,
            checks: 0,
            digest: String::new(),
            stats: HeapStats::default(),
        },
    };

    for iter in 1..=config.iterations {
        run.step(iter, config)?;
        if config.check_every > 0 && iter % config.check_every == 0 {
            run.heap
                .heap_check()
                .map_err(|source| HarnessError::Torture { op: iter, source })?;
            run.report.checks += 1;
        }
    }

    let end = config.iterations + 1;
    while let Some(gone) = run.live.pop() {
        run.heap
            .release(gone.ptr.as_ptr(), CallSite::caller())
            .map_err(|source| HarnessError::Torture { op: end, source })?;
        run.report.frees += 1;
    }
    run.heap
        .heap_check()
        .map_err(|source| HarnessError::Torture { op: end, source })?;
    run.report.checks += 1;

    let mut report = run.report;
    report.stats = run.heap.stats();
    report.digest = hex_lower(&run.hasher.finalize());

    if let Some(emitter) = run.emitter {
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        emitter.emit_entry(
            LogEntry::event(LogLevel::Info, "torture_complete")
                .with_outcome(Outcome::Pass)
                .with_duration_ms(elapsed)
                .with_details(serde_json::to_value(&report)?),
        )?;
        emitter.flush()?;
    }
    Ok(report)
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(seed: u64, flags: DebugFlags) -> TortureConfig {
        TortureConfig {
            seed,
            iterations: 600,
            max_live: 40,
            arena_bytes: 32 << 20,
            check_every: 100,
            flags,
            ..TortureConfig::default()
        }
    }

    #[test]
    fn same_seed_same_digest() {
        let a = run::<Vec<u8>>(&small(7, DebugFlags::CHECK_FENCE), None).unwrap();
        let b = run::<Vec<u8>>(&small(7, DebugFlags::CHECK_FENCE), None).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
        let c = run::<Vec<u8>>(&small(8, DebugFlags::CHECK_FENCE), None).unwrap();
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn everything_is_released_at_the_end() {
        let report = run::<Vec<u8>>(&small(3, DebugFlags::empty()), None).unwrap();
        assert_eq!(report.allocs, report.frees);
        assert_eq!(report.stats.pointers_current, 0);
        assert_eq!(report.stats.alloc_current, 0);
        assert_eq!(report.checks, 7);
    }

    #[test]
    fn strict_flags_survive_the_workload() {
        let flags = DebugFlags::CHECK_FENCE
            | DebugFlags::CHECK_HEAP
            | DebugFlags::CHECK_BLANK
            | DebugFlags::FREE_BLANK
            | DebugFlags::ALLOC_BLANK
            | DebugFlags::REALLOC_COPY;
        let report = run::<Vec<u8>>(&small(11, flags), None).unwrap();
        assert!(report.resizes > 0);
        assert!(report.peak_live > 1);
    }

    #[test]
    fn emitter_gets_one_line_per_op_and_a_summary() {
        let mut emitter = LogEmitter::new(Vec::new(), "torture");
        let config = TortureConfig {
            iterations: 50,
            ..small(5, DebugFlags::CHECK_FENCE)
        };
        run(&config, Some(&mut emitter)).unwrap();
        let text = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 51);
        assert!(lines[50].contains("torture_complete"));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_lower(&[0x00, 0xab, 0x7f]), "00ab7f");
    }
}
