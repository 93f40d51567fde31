//! Debugging heap benchmarks, with the system allocator as a baseline.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use fencepost_core::{CallSite, ChunkHeap, DebugFlags, ReservedArena};

const ARENA_BYTES: usize = 512 << 20;

fn heap(flags: DebugFlags) -> ChunkHeap<ReservedArena> {
    let arena = ReservedArena::new(ARENA_BYTES).expect("arena reservation");
    ChunkHeap::new(arena, flags)
}

fn flag_sets() -> [(&'static str, DebugFlags); 3] {
    [
        ("plain", DebugFlags::empty()),
        ("fenced", DebugFlags::CHECK_FENCE),
        (
            "blanked",
            DebugFlags::CHECK_FENCE | DebugFlags::FREE_BLANK | DebugFlags::ALLOC_BLANK,
        ),
    ]
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
        for (name, flags) in flag_sets() {
            let mut heap = heap(flags);
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &sz| {
                b.iter(|| {
                    let p = heap.allocate(sz, CallSite::Unknown).unwrap();
                    heap.release(criterion::black_box(p).as_ptr(), CallSite::Unknown)
                        .unwrap();
                });
            });
        }
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    for (name, flags) in flag_sets() {
        let mut heap = heap(flags);
        let mut live = Vec::with_capacity(1000);
        group.bench_function(format!("1000x64B/{name}"), |b| {
            b.iter(|| {
                for _ in 0..1000 {
                    live.push(heap.allocate(64, CallSite::Unknown).unwrap());
                }
                for p in live.drain(..).rev() {
                    heap.release(p.as_ptr(), CallSite::Unknown).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resize");

    for (label, copy) in [("in_place", DebugFlags::empty()), ("copy", DebugFlags::REALLOC_COPY)] {
        let mut heap = heap(DebugFlags::CHECK_FENCE | copy);
        group.bench_function(label, |b| {
            b.iter(|| {
                let p = heap.allocate(100, CallSite::Unknown).unwrap();
                let p = heap.resize(p.as_ptr(), 60, CallSite::Unknown).unwrap().unwrap();
                heap.release(p.as_ptr(), CallSite::Unknown).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_heap_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_check");

    for count in [100usize, 1000] {
        let mut heap = heap(DebugFlags::CHECK_FENCE | DebugFlags::CHECK_LISTS);
        let live: Vec<_> = (0..count)
            .map(|i| heap.allocate(16 + i % 300, CallSite::Unknown).unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| heap.heap_check().unwrap());
        });
        criterion::black_box(live);
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_resize,
    bench_heap_check
);
criterion_main!(benches);
