//! Benchmarks for job store operations using criterion.
//!
//! - Single enqueue
//! - Lease + ack with a deep backlog
//! - Full lifecycle (enqueue → lease → ack) at several batch sizes
//! - Rate limiter admission

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::Duration;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald::*;
use herald_testkit::{email_job, tenant, webhook_job};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let store = Arc::new(InMemoryJobStore::new());
        let job = email_job("bench@example.com");

        b.to_async(&rt).iter(|| async {
            store
                .enqueue(job.clone())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

fn bench_lease_ack_with_backlog(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("lease_ack_backlog");
    for backlog in [100usize, 1_000, 10_000] {
        let store = Arc::new(InMemoryJobStore::new());
        rt.block_on(async {
            for _ in 0..backlog {
                store
                    .enqueue(webhook_job("https://hooks.example.com/in"))
                    .await
                    .expect("seed");
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.to_async(&rt).iter(|| async {
                let leases = store
                    .lease(LeaseRequest::new("bench", 1, Duration::seconds(30)))
                    .await
                    .expect("lease");
                for lease in leases {
                    // Hand it back so the backlog stays constant.
                    store
                        .release(lease.job_id(), lease.lease_id)
                        .await
                        .expect("release");
                }
            });
        });
    }
    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("lifecycle");
    for batch in [1usize, 5, 25] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let store = Arc::new(InMemoryJobStore::new());
            b.to_async(&rt).iter(|| async {
                for _ in 0..batch {
                    store.enqueue(email_job("bench@example.com")).await.expect("enqueue");
                }
                let leases = store
                    .lease(LeaseRequest::new("bench", batch, Duration::seconds(30)))
                    .await
                    .expect("lease");
                for lease in leases {
                    store.ack(lease.job_id(), lease.lease_id).await.expect("ack");
                }
                store
                    .prune_retained(&RetentionConfig::default())
                    .await
                    .expect("prune");
            });
        });
    }
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let rt = create_runtime();
    let limiter = SlidingWindowRateLimiter::new(
        RateLimitConfig::new(usize::MAX, std::time::Duration::from_millis(100)).with_per_tenant_limit(usize::MAX),
    );
    let tenant = tenant();

    c.bench_function("rate_limiter_try_acquire", |b| {
        b.to_async(&rt).iter(|| async {
            limiter.try_acquire(&tenant).await;
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_lease_ack_with_backlog,
    bench_lifecycle,
    bench_rate_limiter
);
criterion_main!(benches);
