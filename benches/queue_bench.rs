//! Benchmarks for the scheduler and the account pool.
//!
//! Benchmarks cover:
//! - Pipeline enqueue and dispatch throughput
//! - Priority promotion in a long queue
//! - Account pool acquire/release cycles, uncontended and contended
//! - End-to-end work queue runs with trivial jobs

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use hostqueue::account::{Account, AccountPool, OwnerToken};
use hostqueue::core::{Job, JobContext, Pipeline, WorkQueue};

// ============================================================================
// Pipeline Benchmarks
// ============================================================================

fn bench_pipeline_enqueue_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_enqueue_dispatch");
    for size in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let pipeline: Pipeline<u64> = Pipeline::new(usize::MAX);
                for i in 0..size {
                    pipeline.enqueue(i, None);
                }
                for _ in 0..size {
                    let (id, item) = pipeline.next().unwrap_or_default();
                    black_box(item);
                    pipeline.task_done(id);
                }
            });
        });
    }
    group.finish();
}

fn bench_pipeline_priority_raise(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_priority_raise");
    for size in [100_u64, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let pipeline: Pipeline<u64> = Pipeline::new(1);
            for i in 0..size {
                pipeline.enqueue(i, Some(format!("host{i}")));
            }
            let mut n = 0;
            b.iter(|| {
                n = (n + 7) % size;
                black_box(pipeline.priority_enqueue_or_raise(n, &format!("host{n}"), false));
            });
        });
    }
    group.finish();
}

// ============================================================================
// Account Pool Benchmarks
// ============================================================================

fn pool_of(n: usize) -> AccountPool {
    AccountPool::with_accounts((0..n).map(|i| Arc::new(Account::new(format!("user{i}"), "pw"))))
}

fn bench_pool_acquire_release(c: &mut Criterion) {
    let pool = pool_of(8);
    let owner = OwnerToken::from("bench");
    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let account = pool.acquire_account(None, &owner);
            black_box(&account);
            let _ = pool.release_accounts(&owner);
        });
    });
}

fn bench_pool_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_contended");
    for threads in [2_usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = pool_of(2);
                b.iter(|| {
                    let workers: Vec<_> = (0..threads)
                        .map(|_| {
                            let pool = pool.clone();
                            thread::spawn(move || {
                                for _ in 0..50 {
                                    let owner = OwnerToken::unique();
                                    if pool.acquire_account(None, &owner).is_ok() {
                                        let _ = pool.release_accounts(&owner);
                                    }
                                }
                            })
                        })
                        .collect();
                    for worker in workers {
                        let _ = worker.join();
                    }
                });
            },
        );
    }
    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_workqueue_trivial_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("workqueue_trivial_jobs");
    group.sample_size(20);
    for max_threads in [1_usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_threads),
            &max_threads,
            |b, &max_threads| {
                let Ok(queue) = WorkQueue::new(max_threads) else {
                    return;
                };
                b.iter(|| {
                    for i in 0..64 {
                        let _ = queue.enqueue(Job::new(format!("job{i}"), |_: &JobContext| Ok(())));
                    }
                    queue.wait_until_done();
                });
                queue.shutdown(false);
            },
        );
    }
    group.finish();
}

criterion_group!(
    pipeline_benches,
    bench_pipeline_enqueue_dispatch,
    bench_pipeline_priority_raise
);

criterion_group!(pool_benches, bench_pool_acquire_release, bench_pool_contended);

criterion_group!(scenario_benches, bench_workqueue_trivial_jobs);

criterion_main!(pipeline_benches, pool_benches, scenario_benches);
