//! # Pool Benchmark
//!
//! Measures the cost of borrowing and returning pooled buffers against
//! allocating a fresh one per message, single-threaded and under contention.

#![allow(dead_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardsync_core::{BufferPool, SwapQueue};

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");
    let pool = BufferPool::new(10 * 1024, 64);

    group.bench_function("pooled", |b| {
        b.iter(|| {
            let mut buf = pool.acquire();
            buf.extend_from_slice(black_box(&[1u8; 128]));
            pool.release(buf);
        });
    });

    group.bench_function("fresh_vec", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(10 * 1024);
            buf.extend_from_slice(black_box(&[1u8; 128]));
            black_box(buf);
        });
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_contended");

    for threads in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &n| {
            let pool = BufferPool::new(1024, 256);
            b.iter(|| {
                let handles: Vec<_> = (0..n)
                    .map(|_| {
                        let pool = pool.clone();
                        std::thread::spawn(move || {
                            for _ in 0..256 {
                                let buf = pool.acquire();
                                pool.release(buf);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    let _ = h.join();
                }
            });
        });
    }

    group.finish();
}

fn bench_swap_queue(c: &mut Criterion) {
    let queue = Arc::new(SwapQueue::with_capacity(1024));
    let mut spare = Vec::with_capacity(1024);

    c.bench_function("swap_queue_push_1000_drain", |b| {
        b.iter(|| {
            for i in 0..1000u32 {
                queue.push(i);
            }
            queue.swap_into(&mut spare);
            black_box(spare.len());
            spare.clear();
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_contended, bench_swap_queue);
criterion_main!(benches);
