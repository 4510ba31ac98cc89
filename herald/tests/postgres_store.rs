//! Integration tests for `PostgresJobStore`.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use chrono::{Duration, Utc};
use herald::*;
use herald_testkit::*;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;

// The store leases across the whole table, so tests must not interleave.
static DB: Mutex<()> = Mutex::const_new(());

async fn store() -> PostgresJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect to postgres");
    let store = PostgresJobStore::new(pool);
    store.migrate().await.expect("migrate");
    sqlx::query("DELETE FROM herald_jobs")
        .execute(store.pool())
        .await
        .expect("clean table");
    store
}

fn request(worker: &str, batch: usize) -> LeaseRequest {
    LeaseRequest::new(worker, batch, Duration::seconds(30))
}

#[tokio::test]
#[ignore]
async fn test_lease_respects_priority_and_increments_attempts() {
    let _guard = DB.lock().await;
    let store = store().await;

    let email = store.enqueue(email_job("ada@example.com")).await.unwrap();
    let ai = store.enqueue(ai_job("task-1", AiAction::AnalyzeContent)).await.unwrap();

    let leases = store.lease(request("w-1", 10)).await.unwrap();
    let order: Vec<JobId> = leases.iter().map(|l| l.job_id()).collect();
    assert_eq!(order, vec![ai.id, email.id]);
    assert!(leases.iter().all(|l| l.attempt() == 1));

    assert!(store.lease(request("w-2", 10)).await.unwrap().is_empty());

    store.ack(ai.id, leases[0].lease_id).await.unwrap();
    let record = store.get(ai.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert!(record.finished_at.is_some());
}

#[tokio::test]
#[ignore]
async fn test_fail_requeues_then_dead_letters_at_max_attempts() {
    let _guard = DB.lock().await;
    let store = store().await;

    let handle = store
        .enqueue(email_job("ada@example.com").with_max_attempts(2))
        .await
        .unwrap();

    let lease = store.lease(request("w-1", 1)).await.unwrap().remove(0);
    let state = store
        .fail(handle.id, lease.lease_id, "smtp down", Some(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(state, JobState::Queued);

    let lease = store.lease(request("w-1", 1)).await.unwrap().remove(0);
    assert_eq!(lease.attempt(), 2);
    let state = store
        .fail(handle.id, lease.lease_id, "smtp down", Some(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(state, JobState::DeadLetter);

    let record = store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_error.as_deref(), Some("smtp down"));
}

#[tokio::test]
#[ignore]
async fn test_stale_lease_is_rejected_and_reaper_keeps_attempts() {
    let _guard = DB.lock().await;
    let store = store().await;

    let handle = store.enqueue(email_job("ada@example.com")).await.unwrap();
    let lease = store
        .lease(LeaseRequest::new("crashed", 1, Duration::milliseconds(10)))
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(store.reap_expired_leases().await.unwrap(), 1);
    let record = store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(record.attempts, 1);

    let err = store.ack(handle.id, lease.lease_id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JobError>(),
        Some(JobError::LeaseExpired { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn test_release_and_prune() {
    let _guard = DB.lock().await;
    let store = store().await;

    let handle = store.enqueue(email_job("ada@example.com")).await.unwrap();
    let lease = store.lease(request("w-1", 1)).await.unwrap().remove(0);
    store.release(handle.id, lease.lease_id).await.unwrap();
    let record = store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(record.attempts, 0);

    for i in 0..3 {
        store.enqueue(email_job(&format!("u{i}@example.com"))).await.unwrap();
    }
    for lease in store.lease(request("w-1", 10)).await.unwrap() {
        store.ack(lease.job_id(), lease.lease_id).await.unwrap();
    }

    let pruned = store
        .prune_retained(&RetentionConfig {
            keep_completed: 1,
            keep_dead_lettered: 0,
        })
        .await
        .unwrap();
    assert_eq!(pruned, 3);
    assert_eq!(store.snapshot().await.unwrap().totals().completed_count, 1);
}
