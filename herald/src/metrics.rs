//! Prometheus metrics for the job subsystem.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `herald_jobs_enqueued_total` - Jobs accepted by the enqueue API
//! - `herald_jobs_leased_total` - Leases handed to workers
//! - `herald_jobs_rate_limited_total` - Leased jobs that waited on the rate limiter
//! - `herald_jobs_completed_total` - Settled attempts by status (success, retry, dead_letter)
//! - `herald_lease_expired_total` - Leases lost by their worker
//! - `herald_leases_reaped_total` - Expired leases recovered by the housekeeper
//! - `herald_retention_pruned_total` - Finished jobs dropped by retention
//!
//! ## Gauges
//! - `herald_queue_depth` - Jobs per type and state
//! - `herald_rate_limit_utilization` - Global window usage percentage
//!
//! ## Histograms
//! - `herald_job_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for herald metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `tenant_id`, `job_type`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["tenant_id", "job_type"])
        .expect("herald_jobs_enqueued_total metric creation failed")
});

/// Labels: `tenant_id`, `job_type`.
pub static JOBS_LEASED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_jobs_leased_total", "Total number of job leases granted");
    CounterVec::new(opts, &["tenant_id", "job_type"])
        .expect("herald_jobs_leased_total metric creation failed")
});

/// Labels: `tenant_id`, `job_type`.
pub static JOBS_RATE_LIMITED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "herald_jobs_rate_limited_total",
        "Total number of leased jobs delayed by the rate limiter",
    );
    CounterVec::new(opts, &["tenant_id", "job_type"])
        .expect("herald_jobs_rate_limited_total metric creation failed")
});

/// Labels: `tenant_id`, `job_type`, `status`.
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "herald_jobs_completed_total",
        "Total number of settled job attempts",
    );
    CounterVec::new(opts, &["tenant_id", "job_type", "status"])
        .expect("herald_jobs_completed_total metric creation failed")
});

/// Labels: `tenant_id`, `job_type`.
pub static LEASE_EXPIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_lease_expired_total", "Total number of leases lost by workers");
    CounterVec::new(opts, &["tenant_id", "job_type"])
        .expect("herald_lease_expired_total metric creation failed")
});

pub static LEASES_REAPED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "herald_leases_reaped_total",
        "Total number of expired leases recovered by the housekeeper",
    )
    .expect("herald_leases_reaped_total metric creation failed")
});

pub static RETENTION_PRUNED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "herald_retention_pruned_total",
        "Total number of finished jobs removed by retention",
    )
    .expect("herald_retention_pruned_total metric creation failed")
});

/// Labels: `job_type`, `state`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_queue_depth", "Jobs held per type and state");
    GaugeVec::new(opts, &["job_type", "state"]).expect("herald_queue_depth metric creation failed")
});

pub static RATE_LIMIT_UTILIZATION: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "herald_rate_limit_utilization",
        "Global rate-limit window usage percentage (0-100)",
    )
    .expect("herald_rate_limit_utilization metric creation failed")
});

/// Labels: `job_type`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "herald_job_duration_seconds",
        "Job handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("herald_job_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_LEASED_TOTAL.clone()),
        Box::new(JOBS_RATE_LIMITED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(LEASE_EXPIRED_TOTAL.clone()),
        Box::new(LEASES_REAPED_TOTAL.clone()),
        Box::new(RETENTION_PRUNED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(RATE_LIMIT_UTILIZATION.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(tenant_id: &str, job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[tenant_id, job_type]).inc();
}

pub fn record_job_leased(tenant_id: &str, job_type: &str) {
    JOBS_LEASED_TOTAL.with_label_values(&[tenant_id, job_type]).inc();
}

pub fn record_rate_limited(tenant_id: &str, job_type: &str) {
    JOBS_RATE_LIMITED_TOTAL.with_label_values(&[tenant_id, job_type]).inc();
}

pub fn record_job_completed(tenant_id: &str, job_type: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[tenant_id, job_type, status])
        .inc();
}

pub fn record_lease_expired(tenant_id: &str, job_type: &str) {
    LEASE_EXPIRED_TOTAL.with_label_values(&[tenant_id, job_type]).inc();
}

pub fn record_leases_reaped(count: u64) {
    LEASES_REAPED_TOTAL.inc_by(count as f64);
}

pub fn record_retention_pruned(count: u64) {
    RETENTION_PRUNED_TOTAL.inc_by(count as f64);
}

pub fn set_queue_depth(job_type: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[job_type, state]).set(depth);
}

pub fn set_rate_limit_utilization(utilization: f64) {
    RATE_LIMIT_UTILIZATION.set(utilization);
}

pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
