use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::error::JobError;
use crate::job::{JobHandle, JobId, JobPayload, JobPriority, JobRecord, JobState, JobType, NewJob, TenantId};
use crate::lease::{JobLease, LeaseId, LeaseRenewal, LeaseRequest};
use crate::queue::{JobStore, QueueSnapshot};

/// Schema applied by [`PostgresJobStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, tenant_id, priority, state, attempts, max_attempts,
    available_at, last_error, lease_owner, lease_id, lease_expires_at,
    created_at, updated_at, finished_at
"#;

/// PostgreSQL-backed job store.
///
/// Leasing relies on `FOR UPDATE SKIP LOCKED`, so any number of worker
/// processes can share one table without handing a job out twice.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `herald_jobs` table and its indexes if they are missing.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Distinguish a lost lease from a missing job after a guarded update
    /// matched no rows.
    async fn lease_error(&self, job_id: JobId) -> anyhow::Error {
        match sqlx::query("SELECT 1 FROM herald_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => JobError::LeaseExpired { job_id }.into(),
            Ok(None) => anyhow::anyhow!("job not found: {}", job_id),
            Err(err) => err.into(),
        }
    }
}

fn attempts_from_db(value: i32, column: &str) -> anyhow::Result<u16> {
    u16::try_from(value).map_err(|_| anyhow::anyhow!("{column} out of range: {value}"))
}

fn decode_job(row: &PgRow) -> anyhow::Result<JobRecord> {
    let job_type: String = row.try_get("job_type")?;
    let state: String = row.try_get("state")?;
    let payload: JobPayload = serde_json::from_value(row.try_get("payload")?)?;
    let tenant_id: String = row.try_get("tenant_id")?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        job_type: job_type.parse::<JobType>()?,
        payload,
        tenant_id: TenantId::new(tenant_id),
        priority: JobPriority(row.try_get("priority")?),
        available_at: row.try_get("available_at")?,
        attempts: attempts_from_db(row.try_get("attempts")?, "attempts")?,
        max_attempts: attempts_from_db(row.try_get("max_attempts")?, "max_attempts")?,
        state: state.parse()?,
        last_error: row.try_get("last_error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_id: row.try_get::<Option<Uuid>, _>("lease_id")?.map(LeaseId),
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle> {
        job.validate()?;
        let record = JobRecord::queued(JobId::new(), job, Utc::now());
        let payload_json = serde_json::to_value(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO herald_jobs (
                id, job_type, payload, tenant_id, priority, state, attempts,
                max_attempts, available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'queued', 0, $6, $7, $8, $8)
            "#,
        )
        .bind(record.id.0)
        .bind(record.job_type.as_str())
        .bind(&payload_json)
        .bind(record.tenant_id.as_str())
        .bind(record.priority.value())
        .bind(i32::from(record.max_attempts))
        .bind(record.available_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(JobHandle::from(&record))
    }

    async fn lease(&self, request: LeaseRequest) -> anyhow::Result<Vec<JobLease>> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let ttl_ms = request.lease_ttl.num_milliseconds();

        let rows = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM herald_jobs
                WHERE state = 'queued'
                  AND available_at <= NOW()
                ORDER BY priority, available_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE herald_jobs j
            SET state = 'active',
                attempts = j.attempts + 1,
                lease_owner = $2,
                lease_id = gen_random_uuid(),
                lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(request.batch_size as i64)
        .bind(&request.worker_id)
        .bind(ttl_ms)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut leases = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = decode_job(row)?;
            let (Some(lease_id), Some(expires_at)) = (job.lease_id, job.lease_expires_at) else {
                anyhow::bail!("leased job {} is missing lease columns", job.id);
            };
            leases.push(JobLease {
                lease_id,
                worker_id: request.worker_id.clone(),
                expires_at,
                job,
            });
        }

        // UPDATE ... RETURNING does not preserve the CTE ordering.
        leases.sort_by_key(|l| (l.job.priority, l.job.available_at, l.job.created_at));
        Ok(leases)
    }

    async fn ack(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'completed',
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND lease_id = $2
              AND state = 'active'
            "#,
        )
        .bind(job_id.0)
        .bind(lease_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.lease_error(job_id).await);
        }
        debug!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        next_available_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<JobState> {
        let row = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts THEN 'queued'
                    ELSE 'dead_letter'
                END,
                available_at = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts
                        THEN GREATEST(available_at, $4::timestamptz)
                    ELSE available_at
                END,
                finished_at = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts THEN NULL
                    ELSE NOW()
                END,
                last_error = $3,
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND lease_id = $2
              AND state = 'active'
            RETURNING state, attempts
            "#,
        )
        .bind(job_id.0)
        .bind(lease_id.0)
        .bind(error)
        .bind(next_available_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(self.lease_error(job_id).await);
        };
        let state: JobState = row.try_get::<String, _>("state")?.parse()?;
        if state == JobState::DeadLetter {
            let attempts: i32 = row.try_get("attempts")?;
            warn!(job_id = %job_id, attempts, "job moved to dead_letter");
        }
        Ok(state)
    }

    async fn release(&self, job_id: JobId, lease_id: LeaseId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'queued',
                attempts = GREATEST(attempts - 1, 0),
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND lease_id = $2
              AND state = 'active'
            "#,
        )
        .bind(job_id.0)
        .bind(lease_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.lease_error(job_id).await);
        }
        Ok(())
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<DateTime<Utc>> {
        let row = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET lease_expires_at = NOW() + ($1::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE id = $2
              AND lease_id = $3
              AND lease_owner = $4
              AND state = 'active'
            RETURNING lease_expires_at
            "#,
        )
        .bind(renewal.extend_by.num_milliseconds())
        .bind(renewal.job_id.0)
        .bind(renewal.lease_id.0)
        .bind(&renewal.worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("lease_expires_at")?),
            None => {
                warn!(job_id = %renewal.job_id, lease_id = %renewal.lease_id, "lease renewal rejected");
                Err(self.lease_error(renewal.job_id).await)
            }
        }
    }

    async fn reap_expired_leases(&self) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        let dead = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'dead_letter',
                last_error = 'lease expired on final attempt',
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE state = 'active'
              AND lease_expires_at < NOW()
              AND attempts >= max_attempts
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'queued',
                last_error = 'lease expired',
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE state = 'active'
              AND lease_expires_at < NOW()
              AND attempts < max_attempts
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if dead > 0 {
            warn!(count = dead, "expired leases dead-lettered");
        }
        if requeued > 0 {
            debug!(count = requeued, "expired leases requeued");
        }
        Ok(dead + requeued)
    }

    async fn requeue_dead_letter(&self, job_id: JobId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'queued',
                attempts = 0,
                available_at = GREATEST(available_at, NOW()),
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'dead_letter'
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("job {} not found or not dead-lettered", job_id);
        }
        Ok(())
    }

    async fn prune_retained(&self, retention: &RetentionConfig) -> anyhow::Result<u64> {
        let mut removed = 0;
        for (state, keep) in [
            (JobState::Completed, retention.keep_completed),
            (JobState::DeadLetter, retention.keep_dead_lettered),
        ] {
            removed += sqlx::query(
                r#"
                DELETE FROM herald_jobs
                WHERE id IN (
                    SELECT id
                    FROM herald_jobs
                    WHERE state = $1
                    ORDER BY finished_at DESC NULLS LAST, id DESC
                    OFFSET $2
                )
                "#,
            )
            .bind(state.as_str())
            .bind(keep as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(removed)
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM herald_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT job_type, state, COUNT(*) AS count
            FROM herald_jobs
            GROUP BY job_type, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now());
        for row in rows {
            let job_type: String = row.try_get("job_type")?;
            let state: JobState = row.try_get::<String, _>("state")?.parse()?;
            let count: i64 = row.try_get("count")?;
            snapshot
                .entry_mut(&job_type)
                .record(state, usize::try_from(count).unwrap_or(0));
        }
        Ok(snapshot)
    }
}
