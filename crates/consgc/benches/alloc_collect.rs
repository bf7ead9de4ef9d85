//! Benchmark: allocation fast path, collection pauses and parallel marking.
//!
//! Pause benchmarks keep a chain of nodes reachable from an explicit root
//! and measure one full collection per iteration.

use std::hint::black_box;
use std::ops::Range;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use consgc::{Collector, GcConfig, ThreadHandle};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn config(markers: usize) -> GcConfig {
    GcConfig::default()
        .with_markers(markers)
        .with_initial_heap_size(16 << 20)
        .with_scan_stacks(false)
}

/// Builds a linked chain of `len` nodes and returns its head.
fn build_chain(me: &ThreadHandle, len: usize) -> NonNull<u8> {
    let mut head = 0usize;
    for _ in 0..len {
        let node = me.alloc(32).unwrap();
        unsafe { node.cast::<usize>().write(head) };
        head = node.as_ptr() as usize;
    }
    NonNull::new(head as *mut u8).unwrap()
}

fn root_range(slot: &usize) -> Range<usize> {
    let start = std::ptr::from_ref(slot) as usize;
    start..start + size_of::<usize>()
}

fn bench_small_alloc(c: &mut Criterion) {
    let gc = Collector::new(config(1)).unwrap();
    let me = gc.register_current_thread().unwrap();
    c.bench_function("alloc_small_32", |b| {
        b.iter(|| black_box(me.alloc(black_box(32)).unwrap()));
    });
    c.bench_function("alloc_atomic_256", |b| {
        b.iter(|| black_box(me.alloc_atomic(black_box(256)).unwrap()));
    });
}

fn bench_large_alloc(c: &mut Criterion) {
    let gc = Collector::new(config(1)).unwrap();
    let me = gc.register_current_thread().unwrap();
    c.bench_function("alloc_large_16k", |b| {
        b.iter(|| black_box(me.alloc(black_box(16 * 1024)).unwrap()));
    });
}

fn bench_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_pause");
    for &(markers, live) in &[(1, 10_000), (1, 100_000), (4, 100_000)] {
        let gc = Collector::new(config(markers)).unwrap();
        let me = gc.register_current_thread().unwrap();
        let root = Box::new(build_chain(&me, live).as_ptr() as usize);
        unsafe { gc.add_roots(root_range(&root)) };

        group.bench_with_input(
            BenchmarkId::new(format!("{markers}_markers"), live),
            &live,
            |b, _| {
                b.iter_custom(|iterations| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iterations {
                        let start = Instant::now();
                        assert!(me.collect());
                        total += start.elapsed();
                    }
                    total
                });
            },
        );
        gc.remove_roots(root_range(&root));
    }
    group.finish();
}

fn bench_alloc_churn(c: &mut Criterion) {
    let gc = Collector::new(config(1)).unwrap();
    let me = gc.register_current_thread().unwrap();
    c.bench_function("churn_1000_nodes", |b| {
        b.iter(|| black_box(build_chain(&me, 1000)));
    });
}

criterion_group!(
    benches,
    bench_small_alloc,
    bench_large_alloc,
    bench_pause,
    bench_alloc_churn
);
criterion_main!(benches);
