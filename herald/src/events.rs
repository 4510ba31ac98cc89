use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobPriority, JobType, TenantId};
use crate::lease::LeaseId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event of the same job.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        tenant_id: TenantId,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            tenant_id,
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Build an event correlated by job id, keyed by transition and attempt.
    pub fn new(tenant_id: TenantId, payload: JobEventPayload) -> Self {
        let job_id = payload.job_id();
        let key = match payload.attempt() {
            Some(attempt) => format!("{}-{}-{}", payload.name(), job_id, attempt),
            None => format!("{}-{}", payload.name(), job_id),
        };
        Self {
            meta: EventMeta::new(tenant_id, Some(job_id.0), key),
            payload,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was accepted by the store.
    Enqueued {
        job_id: JobId,
        job_type: JobType,
        priority: JobPriority,
        available_at: DateTime<Utc>,
    },
    /// Job was claimed by a worker.
    Leased {
        job_id: JobId,
        job_type: JobType,
        lease_id: LeaseId,
        worker_id: String,
        attempt: u16,
    },
    /// The rate limiter denied a leased job; it stays active and is re-checked.
    RateLimited { job_id: JobId, job_type: JobType },
    /// Job completed successfully.
    Completed {
        job_id: JobId,
        job_type: JobType,
        attempt: u16,
    },
    /// An attempt failed and the job was re-queued with backoff.
    RetryScheduled {
        job_id: JobId,
        job_type: JobType,
        attempt: u16,
        delay_ms: i64,
        available_at: DateTime<Utc>,
        error: String,
    },
    /// Job reached its terminal failure state.
    DeadLettered {
        job_id: JobId,
        job_type: JobType,
        attempts: u16,
        reason: String,
        error: String,
    },
    /// Job was handed back to the queue during shutdown without consuming an attempt.
    Released { job_id: JobId, job_type: JobType },
    /// The worker lost its lease before the job settled.
    LeaseExpired { job_id: JobId, lease_id: LeaseId },
}

impl JobEventPayload {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEventPayload::Enqueued { job_id, .. }
            | JobEventPayload::Leased { job_id, .. }
            | JobEventPayload::RateLimited { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::RetryScheduled { job_id, .. }
            | JobEventPayload::DeadLettered { job_id, .. }
            | JobEventPayload::Released { job_id, .. }
            | JobEventPayload::LeaseExpired { job_id, .. } => *job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEventPayload::Enqueued { .. } => "enqueued",
            JobEventPayload::Leased { .. } => "leased",
            JobEventPayload::RateLimited { .. } => "rate_limited",
            JobEventPayload::Completed { .. } => "completed",
            JobEventPayload::RetryScheduled { .. } => "retry_scheduled",
            JobEventPayload::DeadLettered { .. } => "dead_lettered",
            JobEventPayload::Released { .. } => "released",
            JobEventPayload::LeaseExpired { .. } => "lease_expired",
        }
    }

    fn attempt(&self) -> Option<u16> {
        match self {
            JobEventPayload::Leased { attempt, .. }
            | JobEventPayload::Completed { attempt, .. }
            | JobEventPayload::RetryScheduled { attempt, .. } => Some(*attempt),
            JobEventPayload::DeadLettered { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Trait for publishing job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish a job event.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;
    /// Subscribe to job events.
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers. A subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged` and
/// skips ahead; events published with no subscribers are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn completed(job_id: JobId) -> JobEvent {
        JobEvent::new(
            TenantId::from("acme"),
            JobEventPayload::Completed {
                job_id,
                job_type: JobType::Email,
                attempt: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);

        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish(completed(JobId::new())).await.unwrap();
        }

        for _ in 0..5 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish(completed(JobId::new())).await.unwrap();
        }

        match timeout(Duration::from_millis(100), rx.recv()).await.unwrap() {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(completed(JobId::new())).await.unwrap();
    }

    #[test]
    fn test_event_meta_correlates_by_job() {
        let job_id = JobId::new();
        let event = completed(job_id);
        assert_eq!(event.meta.version, 1);
        assert_eq!(event.meta.correlation_id, job_id.0);
        assert_eq!(event.meta.idempotency_key, format!("completed-{job_id}-1"));
        assert_eq!(event.meta.tenant_id.as_str(), "acme");
    }

    #[test]
    fn test_payload_serializes_with_event_tag() {
        let event = completed(JobId::new());
        let value = serde_json::to_value(&event.payload).unwrap();
        assert_eq!(value["event"], "completed");
        assert_eq!(value["job_type"], "email");
    }
}
