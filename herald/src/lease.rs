use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, JobRecord, JobType, TenantId};

/// Unique identifier for a job lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job claimed by one worker until `expires_at`.
///
/// `job` is the record as it stood right after the claim, so
/// `job.attempts` already counts this attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    /// Unique identifier for this lease.
    pub lease_id: LeaseId,
    /// ID of the worker holding this lease.
    pub worker_id: String,
    /// Timestamp when the lease expires.
    pub expires_at: DateTime<Utc>,
    /// The leased job.
    pub job: JobRecord,
}

impl JobLease {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> JobType {
        self.job.job_type
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.job.tenant_id
    }

    /// The 1-based attempt number this lease represents.
    pub fn attempt(&self) -> u16 {
        self.job.attempts
    }

    /// Checks if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Request to claim up to `batch_size` ready jobs.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    /// ID of the worker requesting the lease.
    pub worker_id: String,
    /// Maximum number of jobs to claim.
    pub batch_size: usize,
    /// Time-to-live for each claimed job's lease.
    pub lease_ttl: Duration,
}

impl LeaseRequest {
    pub fn new(worker_id: impl Into<String>, batch_size: usize, lease_ttl: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size,
            lease_ttl,
        }
    }
}

/// Request to extend a lease held by `worker_id`.
#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    pub job_id: JobId,
    /// ID of the lease to renew.
    pub lease_id: LeaseId,
    /// ID of the worker requesting the renewal.
    pub worker_id: String,
    /// New lease duration, measured from now.
    pub extend_by: Duration,
}

/// What the reaper does with a job whose lease ran out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseExpiryOutcome {
    /// Job goes back to `Queued` with its attempt count untouched.
    Requeued,
    /// Job already used its last attempt and is dead-lettered.
    DeadLettered,
}

/// Decide the fate of an expired lease.
///
/// The reaper never increments `attempts`; the claim that expired was
/// already counted when the job was leased. A job that has no attempts left
/// cannot be re-queued without breaking the attempt ceiling.
pub fn process_expired_lease(attempts: u16, max_attempts: u16) -> LeaseExpiryOutcome {
    if attempts >= max_attempts {
        LeaseExpiryOutcome::DeadLettered
    } else {
        LeaseExpiryOutcome::Requeued
    }
}
