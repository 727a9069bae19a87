//! Managed heap benchmarks
//!
//! Measures allocation/release throughput and cycle collection pauses.
//!
//! Run with: `cargo bench -p strata-gc`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use strata_gc::{GcConfig, Heap, ObjRef};

fn quiet_heap() -> Heap {
    Heap::with_config(GcConfig::default().disabled()).unwrap()
}

/// Allocate and immediately release leaf objects
fn alloc_release_benchmark(c: &mut Criterion) {
    let mut heap = quiet_heap();
    c.bench_function("alloc_release_leaf", |b| {
        b.iter(|| {
            let obj = heap.alloc(black_box(42i64)).unwrap();
            heap.decref(obj).unwrap();
        })
    });

    let mut heap = quiet_heap();
    c.bench_function("alloc_release_tracked", |b| {
        b.iter(|| {
            let obj = heap.alloc(Vec::<ObjRef>::with_capacity(2)).unwrap();
            heap.decref(obj).unwrap();
        })
    });
}

/// Release a long chain through the teardown worklist
fn cascade_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade_release");
    for depth in [100, 10_000] {
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &n| {
            let mut heap = quiet_heap();
            b.iter(|| {
                let mut head = heap.alloc(0i64).unwrap();
                for _ in 0..n {
                    head = heap.alloc(vec![head]).unwrap();
                }
                heap.decref(head).unwrap();
            })
        });
    }
    group.finish();
}

/// Collection pause with half of the tracked objects in garbage cycles
fn collect_pause_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_pause");
    for num_objects in [100, 1000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("objects", num_objects),
            &num_objects,
            |b, &n| {
                b.iter_custom(|iters| {
                    let mut total = std::time::Duration::ZERO;
                    for _ in 0..iters {
                        let mut heap = quiet_heap();
                        let mut live = Vec::with_capacity(n / 2);
                        for i in 0..n / 2 {
                            let a = heap.alloc(Vec::<ObjRef>::new()).unwrap();
                            let b = heap.alloc(vec![a]).unwrap();
                            heap.incref(a).unwrap();
                            heap.incref(b).unwrap();
                            heap.get_mut::<Vec<ObjRef>>(a).unwrap().push(b);
                            heap.decref(b).unwrap();
                            if i % 2 == 0 {
                                live.push(a);
                            } else {
                                heap.decref(a).unwrap();
                            }
                        }

                        let start = std::time::Instant::now();
                        black_box(heap.collect(2).unwrap());
                        total += start.elapsed();
                        black_box(&live);
                    }
                    total
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    alloc_release_benchmark,
    cascade_benchmark,
    collect_pause_benchmark
);
criterion_main!(benches);
