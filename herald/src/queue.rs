use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RetentionConfig;
use crate::job::{JobHandle, JobId, JobRecord, JobState, NewJob};
use crate::lease::{JobLease, LeaseId, LeaseRenewal, LeaseRequest};

/// Trait for job store backends.
///
/// The store is the single source of truth for job state. Every state
/// transition is atomic with respect to concurrent callers: `lease` never
/// hands the same job to two workers, and `ack`/`fail`/`release`/`renew`
/// only succeed for the lease that currently owns the job. A stale lease
/// yields [`crate::JobError::LeaseExpired`] wrapped in the returned error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a validated job in the `Queued` state.
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle>;

    /// Claim up to `batch_size` ready jobs, ordered by
    /// `(priority asc, available_at asc)`. Each claimed job becomes
    /// `Active` with its `attempts` incremented.
    async fn lease(&self, request: LeaseRequest) -> anyhow::Result<Vec<JobLease>>;

    /// Mark a leased job as completed.
    async fn ack(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()>;

    /// Record a failed attempt.
    ///
    /// With `next_available_at` and attempts left the job is re-queued no
    /// earlier than its previous `available_at`; otherwise it is
    /// dead-lettered. Returns the state the job ended up in.
    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        next_available_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<JobState>;

    /// Hand a leased job back without consuming the attempt it was claimed for.
    async fn release(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()>;

    /// Extend a lease, returning the new expiry.
    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<DateTime<Utc>>;

    /// Return every `Active` job whose lease expired to `Queued`, leaving
    /// `attempts` untouched. Returns the number of jobs reaped.
    async fn reap_expired_leases(&self) -> anyhow::Result<u64>;

    /// Operator recovery: put a dead-lettered job back in the queue with a
    /// fresh attempt budget.
    async fn requeue_dead_letter(&self, job_id: JobId) -> anyhow::Result<()>;

    /// Drop finished jobs beyond the retention limits. Returns the number removed.
    async fn prune_retained(&self, retention: &RetentionConfig) -> anyhow::Result<u64>;

    /// Fetch a job record.
    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Count jobs per state and type.
    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot>;
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-job-type statistics.
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    /// Create a new queue snapshot at the given time.
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    /// Get or create an entry for a job type.
    pub fn entry_mut(&mut self, job_type: &str) -> &mut QueueSnapshotEntry {
        self.queues.entry(job_type.to_string()).or_default()
    }

    /// Sum the entries across all job types.
    pub fn totals(&self) -> QueueSnapshotEntry {
        self.queues
            .values()
            .fold(QueueSnapshotEntry::default(), |mut acc, entry| {
                acc.queued_count += entry.queued_count;
                acc.active_count += entry.active_count;
                acc.completed_count += entry.completed_count;
                acc.dead_letter_count += entry.dead_letter_count;
                acc.total_count += entry.total_count;
                acc
            })
    }
}

/// Statistics for a single job type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Jobs waiting to be leased (ready or delayed).
    pub queued_count: usize,
    /// Jobs currently leased.
    pub active_count: usize,
    /// Retained completed jobs.
    pub completed_count: usize,
    /// Retained dead-lettered jobs.
    pub dead_letter_count: usize,
    /// Total number of jobs held.
    pub total_count: usize,
}

impl QueueSnapshotEntry {
    /// Count one job in the given state.
    pub fn record(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Queued | JobState::Failed => self.queued_count += count,
            JobState::Active => self.active_count += count,
            JobState::Completed => self.completed_count += count,
            JobState::DeadLetter => self.dead_letter_count += count,
        }
        self.total_count += count;
    }
}
