use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::RetentionConfig;
use crate::error::JobError;
use crate::job::{JobHandle, JobId, JobRecord, JobState, NewJob};
use crate::lease::{
    process_expired_lease, JobLease, LeaseExpiryOutcome, LeaseId, LeaseRenewal, LeaseRequest,
};
use crate::queue::{JobStore, QueueSnapshot};

/// In-process job store.
///
/// All transitions happen under a single mutex, which makes every claim
/// atomic. Suitable for single-process deployments and tests; state does
/// not survive a restart.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    /// Completed job ids, oldest first.
    completed: VecDeque<JobId>,
    /// Dead-lettered job ids, oldest first.
    dead_lettered: VecDeque<JobId>,
}

impl StoreState {
    /// Look up the job owned by `lease_id`, or report the lease as lost.
    fn leased_mut(&mut self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<&mut JobRecord> {
        match self.jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Active && job.lease_id == Some(lease_id) => Ok(job),
            Some(_) => Err(JobError::LeaseExpired { job_id }.into()),
            None => Err(anyhow::anyhow!("job not found: {}", job_id)),
        }
    }

    fn dead_letter(&mut self, job_id: JobId, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = JobState::DeadLetter;
            job.clear_lease();
            job.finished_at = Some(now);
            job.updated_at = now;
            self.dead_lettered.push_back(job_id);
        }
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobStore");
        match self.inner.try_lock() {
            Some(state) => {
                debug.field("jobs", &state.jobs.len());
            }
            None => {
                debug.field("jobs", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently held, in any state.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle> {
        job.validate()?;
        let record = JobRecord::queued(JobId::new(), job, Utc::now());
        let handle = JobHandle::from(&record);
        self.inner.lock().jobs.insert(record.id, record);
        Ok(handle)
    }

    async fn lease(&self, request: LeaseRequest) -> anyhow::Result<Vec<JobLease>> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let expires_at = now + request.lease_ttl;
        let mut state = self.inner.lock();

        let mut ready: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued && job.available_at <= now)
            .collect();
        ready.sort_by_key(|job| (job.priority, job.available_at, job.created_at));
        let claimed: Vec<JobId> = ready
            .into_iter()
            .take(request.batch_size)
            .map(|job| job.id)
            .collect();

        let mut leases = Vec::with_capacity(claimed.len());
        for job_id in claimed {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            let lease_id = LeaseId::new();
            job.state = JobState::Active;
            job.attempts = job.attempts.saturating_add(1);
            job.lease_owner = Some(request.worker_id.clone());
            job.lease_id = Some(lease_id);
            job.lease_expires_at = Some(expires_at);
            job.updated_at = now;

            leases.push(JobLease {
                lease_id,
                worker_id: request.worker_id.clone(),
                expires_at,
                job: job.clone(),
            });
        }

        Ok(leases)
    }

    async fn ack(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let job = state.leased_mut(job_id, lease_id)?;
        job.state = JobState::Completed;
        job.clear_lease();
        job.finished_at = Some(now);
        job.updated_at = now;
        state.completed.push_back(job_id);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        next_available_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<JobState> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let job = state.leased_mut(job_id, lease_id)?;
        job.last_error = Some(error.to_string());

        match next_available_at {
            Some(next) if !job.is_exhausted() => {
                job.state = JobState::Queued;
                job.clear_lease();
                job.available_at = job.available_at.max(next);
                job.updated_at = now;
                Ok(JobState::Queued)
            }
            _ => {
                state.dead_letter(job_id, now);
                Ok(JobState::DeadLetter)
            }
        }
    }

    async fn release(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let job = state.leased_mut(job_id, lease_id)?;
        job.state = JobState::Queued;
        job.attempts = job.attempts.saturating_sub(1);
        job.clear_lease();
        job.updated_at = now;
        Ok(())
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let job = state.leased_mut(renewal.job_id, renewal.lease_id)?;
        if job.lease_owner.as_deref() != Some(renewal.worker_id.as_str()) {
            return Err(JobError::LeaseExpired {
                job_id: renewal.job_id,
            }
            .into());
        }
        let expires_at = now + renewal.extend_by;
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(expires_at)
    }

    async fn reap_expired_leases(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut state = self.inner.lock();

        let expired: Vec<(JobId, u16, u16)> = state
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Active
                    && job.lease_expires_at.map_or(false, |at| at < now)
            })
            .map(|job| (job.id, job.attempts, job.max_attempts))
            .collect();

        for (job_id, attempts, max_attempts) in &expired {
            match process_expired_lease(*attempts, *max_attempts) {
                LeaseExpiryOutcome::Requeued => {
                    if let Some(job) = state.jobs.get_mut(job_id) {
                        job.state = JobState::Queued;
                        job.clear_lease();
                        job.last_error = Some("lease expired".to_string());
                        job.updated_at = now;
                    }
                    debug!(job_id = %job_id, attempts, "expired lease requeued");
                }
                LeaseExpiryOutcome::DeadLettered => {
                    if let Some(job) = state.jobs.get_mut(job_id) {
                        job.last_error = Some("lease expired on final attempt".to_string());
                    }
                    state.dead_letter(*job_id, now);
                    warn!(job_id = %job_id, attempts, "expired lease dead-lettered");
                }
            }
        }

        Ok(expired.len() as u64)
    }

    async fn requeue_dead_letter(&self, job_id: JobId) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {}", job_id))?;
        if job.state != JobState::DeadLetter {
            anyhow::bail!("job {} is {}, not dead-lettered", job_id, job.state);
        }
        job.state = JobState::Queued;
        job.attempts = 0;
        job.available_at = job.available_at.max(now);
        job.finished_at = None;
        job.updated_at = now;
        state.dead_lettered.retain(|id| *id != job_id);
        Ok(())
    }

    async fn prune_retained(&self, retention: &RetentionConfig) -> anyhow::Result<u64> {
        let mut state = self.inner.lock();
        let mut removed = 0u64;

        while state.completed.len() > retention.keep_completed {
            if let Some(job_id) = state.completed.pop_front() {
                if state.jobs.remove(&job_id).is_some() {
                    removed += 1;
                }
            }
        }
        while state.dead_lettered.len() > retention.keep_dead_lettered {
            if let Some(job_id) = state.dead_lettered.pop_front() {
                if state.jobs.remove(&job_id).is_some() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let state = self.inner.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for job in state.jobs.values() {
            snapshot.entry_mut(job.job_type.as_str()).record(job.state, 1);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EmailPayload, JobPayload, JobPriority, TenantId, WebhookPayload};
    use chrono::Duration;
    use serde_json::Map;
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn email(tenant: &str) -> NewJob {
        NewJob::new(JobPayload::Email(EmailPayload {
            to: "user@example.com".into(),
            subject: "Hello".into(),
            template: "welcome".into(),
            variables: Map::new(),
            tenant_id: TenantId::from(tenant),
        }))
    }

    fn webhook() -> NewJob {
        NewJob::new(JobPayload::Webhook(WebhookPayload {
            url: "https://hooks.example.com/x".into(),
            payload: Map::new(),
            headers: StdHashMap::new(),
            tenant_id: TenantId::from("acme"),
            retries: None,
        }))
    }

    fn request(batch: usize) -> LeaseRequest {
        LeaseRequest::new("worker-1", batch, Duration::seconds(30))
    }

    #[tokio::test]
    async fn test_lease_orders_by_priority_then_availability() {
        let store = InMemoryJobStore::new();
        let low = store.enqueue(email("acme")).await.unwrap();
        let high = store
            .enqueue(webhook().with_priority(JobPriority(1)))
            .await
            .unwrap();
        let mid = store.enqueue(webhook()).await.unwrap();

        let leases = store.lease(request(3)).await.unwrap();
        let order: Vec<JobId> = leases.iter().map(|l| l.job_id()).collect();
        assert_eq!(order, vec![high.id, mid.id, low.id]);
        assert!(leases.iter().all(|l| l.job.state == JobState::Active));
        assert!(leases.iter().all(|l| l.attempt() == 1));
    }

    #[tokio::test]
    async fn test_delayed_jobs_are_not_leased_early() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(email("acme").with_delay(Duration::minutes(5)))
            .await
            .unwrap();
        assert!(store.lease(request(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_requires_current_lease() {
        let store = InMemoryJobStore::new();
        let handle = store.enqueue(email("acme")).await.unwrap();
        let lease = store.lease(request(1)).await.unwrap().remove(0);

        let err = store.ack(handle.id, LeaseId::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::LeaseExpired { .. })
        ));

        store.ack(handle.id, lease.lease_id).await.unwrap();
        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.lease_id.is_none());
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_requeues_then_dead_letters() {
        let store = InMemoryJobStore::new();
        let handle = store
            .enqueue(email("acme").with_max_attempts(2))
            .await
            .unwrap();

        let lease = store.lease(request(1)).await.unwrap().remove(0);
        let next = Utc::now() - Duration::milliseconds(1);
        let state = store
            .fail(handle.id, lease.lease_id, "smtp timeout", Some(next))
            .await
            .unwrap();
        assert_eq!(state, JobState::Queued);

        let lease = store.lease(request(1)).await.unwrap().remove(0);
        assert_eq!(lease.attempt(), 2);
        let state = store
            .fail(handle.id, lease.lease_id, "smtp timeout again", Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(state, JobState::DeadLetter);

        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("smtp timeout again"));
        assert!(store.lease(request(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_never_moves_available_at_backwards() {
        let store = InMemoryJobStore::new();
        let handle = store.enqueue(email("acme")).await.unwrap();
        let lease = store.lease(request(1)).await.unwrap().remove(0);
        let before = lease.job.available_at;

        store
            .fail(
                handle.id,
                lease.lease_id,
                "x",
                Some(before - Duration::minutes(10)),
            )
            .await
            .unwrap();
        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.available_at, before);
    }

    #[tokio::test]
    async fn test_release_restores_attempt() {
        let store = InMemoryJobStore::new();
        let handle = store.enqueue(email("acme")).await.unwrap();
        let lease = store.lease(request(1)).await.unwrap().remove(0);
        store.release(handle.id, lease.lease_id).await.unwrap();

        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_reap_returns_expired_lease_without_touching_attempts() {
        let store = InMemoryJobStore::new();
        let handle = store.enqueue(email("acme")).await.unwrap();
        let lease = store
            .lease(LeaseRequest::new("crashy", 1, Duration::milliseconds(5)))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(lease.attempt(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.reap_expired_leases().await.unwrap(), 1);

        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.lease_owner.is_none());

        // The crashed worker can no longer settle the job.
        assert!(store.ack(handle.id, lease.lease_id).await.is_err());
    }

    #[tokio::test]
    async fn test_reap_dead_letters_job_on_final_attempt() {
        let store = InMemoryJobStore::new();
        let handle = store
            .enqueue(email("acme").with_max_attempts(1))
            .await
            .unwrap();
        store
            .lease(LeaseRequest::new("crashy", 1, Duration::milliseconds(5)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.reap_expired_leases().await.unwrap();

        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_owner() {
        let store = InMemoryJobStore::new();
        let handle = store.enqueue(email("acme")).await.unwrap();
        let lease = store.lease(request(1)).await.unwrap().remove(0);

        let renewal = LeaseRenewal {
            job_id: handle.id,
            lease_id: lease.lease_id,
            worker_id: "someone-else".into(),
            extend_by: Duration::seconds(60),
        };
        assert!(store.renew(renewal.clone()).await.is_err());

        let expires = store
            .renew(LeaseRenewal {
                worker_id: "worker-1".into(),
                ..renewal
            })
            .await
            .unwrap();
        assert!(expires > lease.expires_at);
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_resets_attempts() {
        let store = InMemoryJobStore::new();
        let handle = store
            .enqueue(email("acme").with_max_attempts(1))
            .await
            .unwrap();
        let lease = store.lease(request(1)).await.unwrap().remove(0);
        store
            .fail(handle.id, lease.lease_id, "bounced", None)
            .await
            .unwrap();

        store.requeue_dead_letter(handle.id).await.unwrap();
        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(store.requeue_dead_letter(handle.id).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent_finished_jobs() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.enqueue(email("acme")).await.unwrap().id);
        }
        for lease in store.lease(request(5)).await.unwrap() {
            store.ack(lease.job_id(), lease.lease_id).await.unwrap();
        }

        let retention = RetentionConfig {
            keep_completed: 2,
            keep_dead_lettered: 2,
        };
        assert_eq!(store.prune_retained(&retention).await.unwrap(), 3);
        assert_eq!(store.len(), 2);
        assert_eq!(store.prune_retained(&retention).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_leases_never_overlap() {
        let store = InMemoryJobStore::new();
        for i in 0..200 {
            store.enqueue(email(&format!("tenant-{}", i % 7))).await.unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let leases = store
                        .lease(LeaseRequest::new(format!("w{w}"), 3, Duration::seconds(30)))
                        .await
                        .unwrap();
                    if leases.is_empty() {
                        break;
                    }
                    mine.extend(leases.into_iter().map(|l| l.job_id()));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} leased twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_snapshot_counts_states() {
        let store = InMemoryJobStore::new();
        store.enqueue(email("acme")).await.unwrap();
        store.enqueue(webhook()).await.unwrap();
        store.lease(request(1)).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let totals = snapshot.totals();
        assert_eq!(totals.total_count, 2);
        assert_eq!(totals.active_count, 1);
        assert_eq!(totals.queued_count, 1);
    }
}
