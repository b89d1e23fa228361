//! Throughput benchmarks: sarc reads and writes vs a mutex-guarded Arc.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sarc::{make_shared, AtomicStrong};
use std::sync::{Arc, Mutex};
use std::thread;

fn single_thread_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_reads");
    group.throughput(Throughput::Elements(1));

    let slot = AtomicStrong::new(make_shared(1234u64));
    group.bench_function("load", |b| {
        b.iter(|| {
            let value = slot.load();
            black_box(*value)
        })
    });
    group.bench_function("get_snapshot", |b| {
        b.iter(|| {
            let snap = slot.get_snapshot();
            black_box(*snap)
        })
    });

    let baseline: Mutex<Arc<u64>> = Mutex::new(Arc::new(1234));
    group.bench_function("mutex_arc_clone", |b| {
        b.iter(|| {
            let value = baseline.lock().unwrap().clone();
            black_box(*value)
        })
    });

    group.finish();
}

fn single_thread_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_writes");
    group.throughput(Throughput::Elements(1));

    let slot = AtomicStrong::new(make_shared(0u64));
    group.bench_function("store", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            slot.store(make_shared(black_box(i)));
        })
    });

    let baseline: Mutex<Arc<u64>> = Mutex::new(Arc::new(0));
    group.bench_function("mutex_arc_replace", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            *baseline.lock().unwrap() = Arc::new(black_box(i));
        })
    });

    group.finish();
}

fn contended_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_mixed");
    const OPS: usize = 10_000;

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS) as u64));
        group.bench_with_input(
            BenchmarkId::new("sarc_90r_10w", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let slot = Arc::new(AtomicStrong::new(make_shared(0u64)));
                    let handles: Vec<_> = (0..threads)
                        .map(|tid| {
                            let slot = slot.clone();
                            thread::spawn(move || {
                                for i in 0..OPS {
                                    if i % 10 == 0 {
                                        slot.store(make_shared((tid * OPS + i) as u64));
                                    } else {
                                        black_box(*slot.get_snapshot());
                                    }
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    single_thread_reads,
    single_thread_writes,
    contended_mixed
);
criterion_main!(benches);
