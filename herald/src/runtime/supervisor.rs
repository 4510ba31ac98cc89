use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::RetentionConfig;
use crate::error::JobError;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{JobId, JobState, TenantId};
use crate::lease::{JobLease, LeaseRenewal, LeaseRequest};
use crate::queue::JobStore;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryController, RetryDecision};
use crate::telemetry;

use super::worker::WorkerConfig;

/// Configuration for the worker pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Jobs claimed per lease call.
    pub batch_size: usize,
    /// Lease time-to-live in milliseconds.
    pub lease_ttl_ms: u64,
    /// First idle sleep when no work is ready, in milliseconds.
    pub poll_interval_ms: u64,
    /// Ceiling for the idle sleep, in milliseconds.
    pub max_poll_interval_ms: u64,
    /// Interval between housekeeper runs in milliseconds.
    pub housekeeper_interval_ms: u64,
    /// How long `stop` waits for in-flight jobs, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 5,
            lease_ttl_ms: 30_000,
            poll_interval_ms: 100,
            max_poll_interval_ms: 2_000,
            housekeeper_interval_ms: 5_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::milliseconds(self.lease_ttl_ms.max(1) as i64)
    }

    /// Renew every lease a worker holds this often.
    pub fn renew_interval(&self) -> StdDuration {
        StdDuration::from_millis((self.lease_ttl_ms / 3).max(1))
    }

    pub fn housekeeper_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.housekeeper_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn worker_config(&self, worker_id: impl Into<String>) -> WorkerConfig {
        WorkerConfig::new(worker_id)
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval_ms)
            .with_max_poll_interval(self.max_poll_interval_ms)
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for dispatching leased jobs to handlers.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Execute the job. Every outcome, including failure, is a value.
    async fn dispatch(&self, lease: &JobLease) -> DispatchStatus;
}

/// Result of job dispatch execution.
#[derive(Clone, Debug)]
pub enum DispatchStatus {
    /// Job completed successfully.
    Success,
    /// Job failed; the error decides whether it is retried.
    Failed(JobError),
}

impl DispatchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchStatus::Success)
    }
}

impl From<JobError> for DispatchStatus {
    fn from(err: JobError) -> Self {
        DispatchStatus::Failed(err)
    }
}

enum Admission {
    Granted,
    Released,
    LeaseLost,
}

/// Leases one worker claimed in a single batch and has not settled yet.
///
/// The batch renewer keeps each of them alive, so jobs waiting behind a
/// rate-limited or slow batch-mate are never reaped.
struct HeldLeases {
    renewals: parking_lot::Mutex<HashMap<JobId, LeaseRenewal>>,
}

impl HeldLeases {
    fn new(renewals: impl IntoIterator<Item = LeaseRenewal>) -> Self {
        Self {
            renewals: parking_lot::Mutex::new(
                renewals.into_iter().map(|renewal| (renewal.job_id, renewal)).collect(),
            ),
        }
    }

    fn contains(&self, job_id: JobId) -> bool {
        self.renewals.lock().contains_key(&job_id)
    }

    fn forget(&self, job_id: JobId) {
        self.renewals.lock().remove(&job_id);
    }

    fn snapshot(&self) -> Vec<LeaseRenewal> {
        self.renewals.lock().values().cloned().collect()
    }
}

/// State shared by every task of one pool.
pub(super) struct PoolShared<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    pub(super) config: WorkerPoolConfig,
    pub(super) retention: RetentionConfig,
    pub(super) store: Arc<S>,
    pub(super) dispatcher: Arc<D>,
    pub(super) limiter: Arc<dyn RateLimiter>,
    pub(super) recheck_delay: StdDuration,
    pub(super) events: Arc<dyn JobEventPublisher>,
    pub(super) retry: RetryController,
    pub(super) shutdown: ShutdownToken,
}

/// Fixed-size pool of worker loops plus a housekeeper.
///
/// Construct with [`super::WorkerPoolBuilder`], then [`start`](Self::start)
/// and eventually [`stop`](Self::stop). A stopped pool cannot be restarted.
pub struct WorkerPool<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    shared: Arc<PoolShared<S, D>>,
    worker_prefix: String,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, D> fmt::Debug for WorkerPool<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("store_type", &type_name::<S>())
            .field("dispatcher_type", &type_name::<D>())
            .field("worker_prefix", &self.worker_prefix)
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

impl<S, D> WorkerPool<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    pub(super) fn from_parts(shared: PoolShared<S, D>, worker_prefix: String) -> Self {
        Self {
            shared: Arc::new(shared),
            worker_prefix,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Get a clone of the job store.
    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.shared.store)
    }

    /// Get a clone of the event publisher.
    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.shared.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shared.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.shutdown.is_cancelled()
    }

    /// Spawn the worker loops and the housekeeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shared.shutdown.is_cancelled() {
            anyhow::bail!("worker pool has been stopped");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("worker pool already started");
        }

        let mut handles = self.handles.lock().await;
        let concurrency = self.shared.config.concurrency.max(1);
        for i in 0..concurrency {
            let worker = self
                .shared
                .config
                .worker_config(format!("{}-w{}", self.worker_prefix, i));
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(async move {
                shared.worker_loop(worker).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        handles.push(tokio::spawn(async move {
            shared.housekeeper_loop().await;
        }));

        info!(
            concurrency,
            batch_size = self.shared.config.batch_size,
            "worker pool started"
        );
        Ok(())
    }

    /// Stop leasing, let in-flight handlers finish, and hand unstarted leases
    /// back to the store. Tasks still running after the shutdown timeout are
    /// aborted; their leases expire and the reaper recovers them.
    pub async fn stop(&self) -> anyhow::Result<()> {
        info!("Initiating graceful shutdown of worker pool");

        self.shared.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    warn!("Worker task timed out during shutdown");
                    handle.abort();
                }
            }
        }

        info!("Worker pool shutdown complete");
        Ok(())
    }

    /// Run one housekeeping pass: reap expired leases, prune finished jobs
    /// and refresh gauges.
    pub async fn run_housekeeping(&self) {
        self.shared.housekeep().await;
    }
}

impl<S, D> PoolShared<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    /// Sleep for `duration`; returns true when shutdown interrupted it.
    async fn sleep_or_shutdown(&self, duration: StdDuration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn publish(&self, tenant_id: &TenantId, payload: JobEventPayload) {
        let event = JobEvent::new(tenant_id.clone(), payload);
        if let Err(err) = self.events.publish(event).await {
            error!("publish job event failed: {err}");
        }
    }

    async fn worker_loop(&self, worker: WorkerConfig) {
        debug!(worker_id = %worker.worker_id, "worker started");
        let mut idle = worker.poll_interval();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let request = LeaseRequest::new(
                worker.worker_id.clone(),
                worker.batch_size,
                self.config.lease_ttl(),
            );
            let leased = self
                .store
                .lease(request)
                .instrument(telemetry::job_lease_span(&worker.worker_id, worker.batch_size))
                .await;

            match leased {
                Ok(leases) if leases.is_empty() => {
                    if self.sleep_or_shutdown(idle).await {
                        break;
                    }
                    idle = worker.next_idle_backoff(idle);
                }
                Ok(leases) => {
                    idle = worker.poll_interval();
                    self.run_batch(leases).await;
                }
                Err(err) => {
                    warn!(worker_id = %worker.worker_id, "lease error: {err:#}");
                    if self.sleep_or_shutdown(idle).await {
                        break;
                    }
                    idle = worker.next_idle_backoff(idle);
                }
            }
        }

        debug!(worker_id = %worker.worker_id, "worker stopped");
    }

    /// Work through one claimed batch in order while a single renewer keeps
    /// every unsettled lease of the batch alive.
    async fn run_batch(&self, leases: Vec<JobLease>) {
        let held = Arc::new(HeldLeases::new(leases.iter().map(|lease| self.renewal_for(lease))));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let renewer = self.spawn_renewer(Arc::clone(&held), cancel_rx);

        let mut pending = leases.into_iter();
        while let Some(lease) = pending.next() {
            if self.shutdown.is_cancelled() {
                for rest in std::iter::once(lease).chain(pending.by_ref()) {
                    held.forget(rest.job_id());
                    self.release(&rest).await;
                }
                break;
            }
            self.process(lease, &held).await;
        }

        let _ = cancel_tx.try_send(());
        let _ = renewer.await;
    }

    async fn process(&self, lease: JobLease, held: &HeldLeases) {
        let tenant_id = lease.tenant_id().clone();
        let job_type = lease.job_type();

        self.publish(
            &tenant_id,
            JobEventPayload::Leased {
                job_id: lease.job_id(),
                job_type,
                lease_id: lease.lease_id,
                worker_id: lease.worker_id.clone(),
                attempt: lease.attempt(),
            },
        )
        .await;
        telemetry::record_job_leased(tenant_id.as_str(), job_type.as_str(), lease.attempt());

        if !held.contains(lease.job_id()) {
            let err = anyhow::Error::from(JobError::LeaseExpired { job_id: lease.job_id() });
            self.lease_lost(&lease, &err).await;
            return;
        }

        match self.wait_for_rate_limit(&lease, held).await {
            Admission::Granted => {}
            Admission::Released | Admission::LeaseLost => return,
        }

        let started = Instant::now();
        let status = AssertUnwindSafe(self.dispatcher.dispatch(&lease))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job_id = %lease.job_id(), "job handler panicked");
                DispatchStatus::Failed(JobError::transient("job handler panicked"))
            });

        held.forget(lease.job_id());
        self.settle(&lease, status, started.elapsed()).await;
    }

    fn renewal_for(&self, lease: &JobLease) -> LeaseRenewal {
        LeaseRenewal {
            job_id: lease.job_id(),
            lease_id: lease.lease_id,
            worker_id: lease.worker_id.clone(),
            extend_by: self.config.lease_ttl(),
        }
    }

    /// Block until the rate limiter admits the job. The job stays `Active`
    /// while it waits and no attempt is spent.
    async fn wait_for_rate_limit(&self, lease: &JobLease, held: &HeldLeases) -> Admission {
        let mut announced = false;
        loop {
            if self.limiter.try_acquire(lease.tenant_id()).await {
                return Admission::Granted;
            }

            if !announced {
                announced = true;
                self.publish(
                    lease.tenant_id(),
                    JobEventPayload::RateLimited {
                        job_id: lease.job_id(),
                        job_type: lease.job_type(),
                    },
                )
                .await;
                telemetry::record_rate_limited(lease.tenant_id().as_str(), lease.job_type().as_str());
            }

            if self.sleep_or_shutdown(self.recheck_delay).await {
                held.forget(lease.job_id());
                self.release(lease).await;
                return Admission::Released;
            }
            if !held.contains(lease.job_id()) {
                let err = anyhow::Error::from(JobError::LeaseExpired { job_id: lease.job_id() });
                self.lease_lost(lease, &err).await;
                return Admission::LeaseLost;
            }
        }
    }

    fn spawn_renewer(&self, held: Arc<HeldLeases>, mut cancel_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.renew_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel_rx.recv() => { break; }
                }

                for renewal in held.snapshot() {
                    let span = telemetry::job_renew_span(
                        renewal.lease_id.to_string(),
                        renewal.job_id.to_string(),
                    );
                    let job_id = renewal.job_id;
                    match store.renew(renewal).instrument(span).await {
                        Ok(expires_at) => trace!(%job_id, %expires_at, "lease renewed"),
                        Err(err) => {
                            warn!(%job_id, "lease renewal failed: {err:#}");
                            held.forget(job_id);
                        }
                    }
                }
            }
        })
    }

    async fn settle(&self, lease: &JobLease, status: DispatchStatus, elapsed: StdDuration) {
        let span = telemetry::job_complete_span(
            lease.job_id().to_string(),
            lease.job_type().as_str(),
            if status.is_success() { "success" } else { "failure" },
        );
        self.record_outcome(lease, status, elapsed).instrument(span).await;
    }

    async fn record_outcome(&self, lease: &JobLease, status: DispatchStatus, elapsed: StdDuration) {
        let job_id = lease.job_id();
        let job_type = lease.job_type();
        let tenant_id = lease.tenant_id();

        match status {
            DispatchStatus::Success => match self.store.ack(job_id, lease.lease_id).await {
                Ok(()) => {
                    self.publish(
                        tenant_id,
                        JobEventPayload::Completed {
                            job_id,
                            job_type,
                            attempt: lease.attempt(),
                        },
                    )
                    .await;
                    telemetry::record_job_completed(tenant_id.as_str(), job_type.as_str(), "success");
                    telemetry::record_job_duration(job_type.as_str(), "success", elapsed);
                }
                Err(err) => self.settle_failed(lease, err).await,
            },
            DispatchStatus::Failed(error) => {
                let reason = error.to_string();
                match self.retry.decide_for(&lease.job, &error, Utc::now()) {
                    RetryDecision::Retry { delay, available_at } => {
                        match self
                            .store
                            .fail(job_id, lease.lease_id, &reason, Some(available_at))
                            .await
                        {
                            Ok(JobState::Queued) => {
                                info!(
                                    job_id = %job_id,
                                    attempt = lease.attempt(),
                                    delay_ms = delay.num_milliseconds(),
                                    error = %reason,
                                    "job failed, retry scheduled"
                                );
                                self.publish(
                                    tenant_id,
                                    JobEventPayload::RetryScheduled {
                                        job_id,
                                        job_type,
                                        attempt: lease.attempt(),
                                        delay_ms: delay.num_milliseconds(),
                                        available_at,
                                        error: reason,
                                    },
                                )
                                .await;
                                telemetry::record_job_completed(tenant_id.as_str(), job_type.as_str(), "retry");
                                telemetry::record_job_duration(job_type.as_str(), "retry", elapsed);
                            }
                            Ok(_) => self.dead_lettered(lease, "exhausted", reason, elapsed).await,
                            Err(err) => self.settle_failed(lease, err).await,
                        }
                    }
                    RetryDecision::DeadLetter { reason: dead_reason } => {
                        match self.store.fail(job_id, lease.lease_id, &reason, None).await {
                            Ok(_) => {
                                self.dead_lettered(lease, dead_reason.as_str(), reason, elapsed)
                                    .await
                            }
                            Err(err) => self.settle_failed(lease, err).await,
                        }
                    }
                }
            }
        }
    }

    async fn dead_lettered(&self, lease: &JobLease, reason: &str, error: String, elapsed: StdDuration) {
        let job_type = lease.job_type();
        warn!(
            job_id = %lease.job_id(),
            attempts = lease.attempt(),
            reason,
            error = %error,
            "job moved to dead letter"
        );
        self.publish(
            lease.tenant_id(),
            JobEventPayload::DeadLettered {
                job_id: lease.job_id(),
                job_type,
                attempts: lease.attempt(),
                reason: reason.to_string(),
                error,
            },
        )
        .await;
        telemetry::record_job_completed(lease.tenant_id().as_str(), job_type.as_str(), "dead_letter");
        telemetry::record_job_duration(job_type.as_str(), "dead_letter", elapsed);
    }

    async fn settle_failed(&self, lease: &JobLease, err: anyhow::Error) {
        if let Some(JobError::LeaseExpired { .. }) = err.downcast_ref::<JobError>() {
            self.lease_lost(lease, &err).await;
        } else {
            error!(job_id = %lease.job_id(), "failed to record job outcome: {err:#}");
        }
    }

    async fn lease_lost(&self, lease: &JobLease, err: &anyhow::Error) {
        warn!(job_id = %lease.job_id(), lease_id = %lease.lease_id, "lease lost: {err:#}");
        self.publish(
            lease.tenant_id(),
            JobEventPayload::LeaseExpired {
                job_id: lease.job_id(),
                lease_id: lease.lease_id,
            },
        )
        .await;
        telemetry::record_lease_expired(lease.tenant_id().as_str(), lease.job_type().as_str());
    }

    async fn release(&self, lease: &JobLease) {
        match self.store.release(lease.job_id(), lease.lease_id).await {
            Ok(()) => {
                debug!(job_id = %lease.job_id(), "lease released on shutdown");
                self.publish(
                    lease.tenant_id(),
                    JobEventPayload::Released {
                        job_id: lease.job_id(),
                        job_type: lease.job_type(),
                    },
                )
                .await;
            }
            Err(err) => debug!(job_id = %lease.job_id(), "release failed: {err:#}"),
        }
    }

    async fn housekeeper_loop(&self) {
        let interval = self.config.housekeeper_interval();
        loop {
            if self.sleep_or_shutdown(interval).await {
                info!("Housekeeper shutting down");
                break;
            }
            self.housekeep().await;
        }
    }

    async fn housekeep(&self) {
        match self.store.reap_expired_leases().await {
            Ok(0) => {}
            Ok(reaped) => telemetry::record_leases_reaped(reaped),
            Err(err) => warn!("housekeeper reap_expired_leases error: {err:#}"),
        }

        match self.store.prune_retained(&self.retention).await {
            Ok(0) => {}
            Ok(pruned) => telemetry::record_retention_pruned(pruned),
            Err(err) => warn!("housekeeper prune_retained error: {err:#}"),
        }

        match self.store.snapshot().await {
            Ok(snapshot) => telemetry::record_queue_snapshot(&snapshot),
            Err(err) => debug!("housekeeper snapshot error: {err:#}"),
        }

        let (current, limit) = self.limiter.utilization().await;
        telemetry::record_rate_limit_utilization(current, limit);
    }
}
