//! Benchmark: full cycles per compaction mode.
//!
//! Measures the wall time of one collection and, separately, the time the
//! mutators spend suspended in its two pauses.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rudo_compact::{CompactionMode, FaultSourceKind, GcConfig, Heap, Mutator};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

const ROOTS: usize = 512;

fn heap(mode: CompactionMode) -> Arc<Heap> {
    let config = GcConfig::default()
        .moving_space_capacity(64 << 20)
        .fault_source(FaultSourceKind::Emulated)
        .mode(mode);
    Heap::new(config).unwrap()
}

/// Allocates `objects` small objects, each pointing at the previous one.
/// Every eighth replaces one of the `ROOTS` root slots; the rest is garbage
/// by the next cycle.
fn churn(mutator: &Mutator, objects: usize) {
    while mutator.root_count() < ROOTS {
        mutator.push_root(None);
    }
    let mut prev = None;
    for i in 0..objects {
        let _runnable = mutator.runnable();
        let obj = mutator.alloc(2, 3).unwrap();
        unsafe {
            mutator.write_ref(obj, 0, prev);
            mutator.write_word(obj, 0, i);
        }
        if i % 8 == 0 {
            mutator.set_root((i / 8) % ROOTS, Some(obj));
            prev = None;
        } else {
            prev = Some(obj);
        }
    }
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");
    group.sample_size(20);
    group.warm_up_time(Duration::from_millis(500));

    for mode in [CompactionMode::Copy, CompactionMode::Minor, CompactionMode::Fallback] {
        for objects in [10_000usize, 50_000] {
            let heap = heap(mode);
            let mutator = heap.attach_mutator();
            group.bench_with_input(BenchmarkId::new(mode.as_str(), objects), &objects, |b, &objects| {
                b.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        churn(&mutator, objects);
                        let stats = heap.collect().unwrap();
                        total += stats.duration;
                        black_box(stats.live_bytes);
                    }
                    total
                });
            });
        }
    }
    group.finish();
}

fn bench_pauses(c: &mut Criterion) {
    let mut group = c.benchmark_group("pauses");
    group.sample_size(20);

    for mode in [CompactionMode::Copy, CompactionMode::Fallback] {
        let heap = heap(mode);
        let mutator = heap.attach_mutator();
        group.bench_function(mode.as_str(), |b| {
            b.iter_custom(|iters| {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    churn(&mutator, 20_000);
                    total += heap.collect().unwrap().total_pause();
                }
                total
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_collection, bench_pauses);
criterion_main!(benches);
