//! Tracing spans and telemetry hooks for the job lifecycle.
//!
//! Every `record_*` helper logs through `tracing` and, when the `metrics`
//! feature is enabled, updates the matching Prometheus series in
//! [`crate::metrics`]. Without the feature they are plain log statements.
//!
//! # Example
//!
//! ```ignore
//! use herald::telemetry::{instrument_dispatch, record_job_enqueued};
//!
//! record_job_enqueued("acme", "email");
//! let outcome = instrument_dispatch(job_id, "email", handler.handle(&ctx, &payload)).await;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::queue::QueueSnapshot;

/// Install a global `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). With `json` set, records are emitted as JSON lines.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

/// Create a tracing span for job dispatch operations.
#[must_use]
pub fn job_dispatch_span(job_id: impl AsRef<str>, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "herald.dispatch",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
    )
}

/// Create a tracing span for one lease call of a worker.
#[must_use]
pub fn job_lease_span(worker_id: impl AsRef<str>, batch_size: usize) -> Span {
    info_span!(
        "herald.lease",
        worker_id = %worker_id.as_ref(),
        batch_size = batch_size,
    )
}

/// Create a tracing span for job enqueue operations.
#[must_use]
pub fn job_enqueue_span(
    tenant_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    priority: i32,
) -> Span {
    info_span!(
        "herald.enqueue",
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        priority = priority,
    )
}

/// Create a tracing span for settling a job outcome.
///
/// `status` is `success` or `failure`.
#[must_use]
pub fn job_complete_span(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) -> Span {
    info_span!(
        "herald.complete",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
    )
}

/// Create a tracing span for lease renewal operations.
#[must_use]
pub fn job_renew_span(lease_id: impl AsRef<str>, job_id: impl AsRef<str>) -> Span {
    info_span!(
        "herald.renew",
        lease_id = %lease_id.as_ref(),
        job_id = %job_id.as_ref(),
    )
}

/// Instrument a future with a job dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = job_dispatch_span(job_id, job_type);
    future.instrument(span)
}

/// Record a job enqueue event.
pub fn record_job_enqueued(tenant_id: impl AsRef<str>, job_type: impl AsRef<str>) {
    tracing::info!(
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(tenant_id.as_ref(), job_type.as_ref());
}

/// Record that a worker leased a job.
pub fn record_job_leased(tenant_id: impl AsRef<str>, job_type: impl AsRef<str>, attempt: u16) {
    tracing::debug!(
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        attempt = attempt,
        "job leased"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_leased(tenant_id.as_ref(), job_type.as_ref());
}

/// Record that a leased job had to wait for the rate limiter.
pub fn record_rate_limited(tenant_id: impl AsRef<str>, job_type: impl AsRef<str>) {
    tracing::debug!(
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        "job rate limited"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_rate_limited(tenant_id.as_ref(), job_type.as_ref());
}

/// Record a settled job.
///
/// `status` is one of `success`, `retry` or `dead_letter`.
pub fn record_job_completed(
    tenant_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    tracing::info!(
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(tenant_id.as_ref(), job_type.as_ref(), status.as_ref());
}

/// Record a lease lost by the worker that held it.
pub fn record_lease_expired(tenant_id: impl AsRef<str>, job_type: impl AsRef<str>) {
    tracing::warn!(
        tenant_id = %tenant_id.as_ref(),
        job_type = %job_type.as_ref(),
        "lease expired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_expired(tenant_id.as_ref(), job_type.as_ref());
}

/// Observe how long a handler ran.
pub fn record_job_duration(job_type: impl AsRef<str>, status: impl AsRef<str>, duration: Duration) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        duration_ms = duration.as_millis() as u64,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_type.as_ref(), status.as_ref(), duration.as_secs_f64());
}

/// Record leases recovered by the housekeeper.
pub fn record_leases_reaped(count: u64) {
    tracing::warn!(count = count, "expired leases reaped");

    #[cfg(feature = "metrics")]
    crate::metrics::record_leases_reaped(count);
}

/// Record finished jobs dropped by retention.
pub fn record_retention_pruned(count: u64) {
    tracing::debug!(count = count, "finished jobs pruned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_retention_pruned(count);
}

/// Publish per-type, per-state job counts.
pub fn record_queue_snapshot(snapshot: &QueueSnapshot) {
    let totals = snapshot.totals();
    tracing::debug!(
        queued = totals.queued_count,
        active = totals.active_count,
        completed = totals.completed_count,
        dead_letter = totals.dead_letter_count,
        "queue snapshot"
    );

    #[cfg(feature = "metrics")]
    for (job_type, entry) in &snapshot.queues {
        crate::metrics::set_queue_depth(job_type, "queued", entry.queued_count as f64);
        crate::metrics::set_queue_depth(job_type, "active", entry.active_count as f64);
        crate::metrics::set_queue_depth(job_type, "completed", entry.completed_count as f64);
        crate::metrics::set_queue_depth(job_type, "dead_letter", entry.dead_letter_count as f64);
    }
}

/// Publish how full the global rate-limit window is, as a percentage.
pub fn record_rate_limit_utilization(current: usize, limit: usize) {
    let utilization = if limit == 0 {
        100.0
    } else {
        (current as f64 / limit as f64) * 100.0
    };
    tracing::trace!(current = current, limit = limit, "rate limit utilization");

    #[cfg(feature = "metrics")]
    crate::metrics::set_rate_limit_utilization(utilization);
    #[cfg(not(feature = "metrics"))]
    let _ = utilization;
}
