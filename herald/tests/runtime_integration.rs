//! End-to-end tests for the worker pool: handlers, retries, dead letters,
//! rate limiting, lease recovery and graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Duration as ChronoDuration;
use herald::*;
use herald_testkit::*;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(10);

fn fast_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 2,
        batch_size: 2,
        lease_ttl_ms: 5_000,
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        housekeeper_interval_ms: 50,
        shutdown_timeout_ms: 5_000,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 20,
        max_backoff_ms: 500,
    }
}

#[derive(Default)]
struct Receiver {
    statuses: Vec<u16>,
    hits: AtomicUsize,
    requests: Mutex<Vec<(HeaderMap, Value)>>,
}

async fn receive(State(state): State<Arc<Receiver>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.requests.lock().push((headers, body));
    let status = state.statuses.get(n).copied().unwrap_or(200);
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

/// Serve a webhook receiver answering `statuses` in order, then 200.
async fn spawn_receiver(statuses: Vec<u16>) -> (String, Arc<Receiver>) {
    let state = Arc::new(Receiver {
        statuses,
        ..Receiver::default()
    });
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), state)
}

struct Harness<D: JobDispatcher + 'static> {
    store: Arc<InMemoryJobStore>,
    bus: Arc<InProcEventBus>,
    client: JobClient<InMemoryJobStore>,
    pool: WorkerPool<InMemoryJobStore, D>,
}

fn harness<D: JobDispatcher + 'static>(
    dispatcher: Arc<D>,
    configure: impl FnOnce(WorkerPoolBuilder<InMemoryJobStore, D>) -> WorkerPoolBuilder<InMemoryJobStore, D>,
) -> Harness<D> {
    let store = Arc::new(InMemoryJobStore::new());
    let bus = Arc::new(InProcEventBus::new(4096));
    let builder = WorkerPoolBuilder::new(fast_pool_config())
        .with_store(store.clone())
        .with_dispatcher(dispatcher)
        .with_events(bus.clone())
        .with_retry_policy(fast_retry());
    let pool = configure(builder).build().unwrap();
    Harness {
        client: JobClient::new(store.clone(), bus.clone()),
        store,
        bus,
        pool,
    }
}

#[tokio::test]
async fn test_webhook_retries_through_server_errors_then_completes() {
    let (url, receiver) = spawn_receiver(vec![500, 500, 200]).await;
    let fakes = FakeHandlers::build(&WebhookConfig::default(), ScriptedTextGenerator::new("ok")).unwrap();
    let h = harness(fakes.registry.clone(), |b| b);
    let mut rx = h.bus.subscribe_jobs();

    let handle = h.client.add_webhook_job(webhook_payload(&url)).await.unwrap();
    h.pool.start().await.unwrap();

    let record = wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("webhook job should complete");
    h.pool.stop().await.unwrap();

    assert_eq!(record.attempts, 3);
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 3);
    assert_eq!(fakes.activity.entries_for("webhook_delivered").len(), 1);

    let delays: Vec<i64> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event.payload {
            JobEventPayload::RetryScheduled { delay_ms, .. } => Some(delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays.len(), 2);
    assert!(delays[1] > delays[0], "backoff should grow: {delays:?}");

    let requests = receiver.requests.lock();
    let (headers, body) = &requests[2];
    assert_eq!(body["event"], "task.created");
    assert_eq!(headers["x-webhook-attempt"], "3");
    assert_eq!(headers["x-webhook-job-id"], handle.id.to_string().as_str());
}

#[tokio::test]
async fn test_webhook_rejection_is_dead_lettered_without_retry() {
    let (url, receiver) = spawn_receiver(vec![404]).await;
    let fakes = FakeHandlers::build(&WebhookConfig::default(), ScriptedTextGenerator::new("ok")).unwrap();
    let h = harness(fakes.registry.clone(), |b| b);
    let mut rx = h.bus.subscribe_jobs();

    let handle = h.client.add_webhook_job(webhook_payload(&url)).await.unwrap();
    h.pool.start().await.unwrap();

    let record = wait_for_state(&*h.store, handle.id, JobState::DeadLetter, WAIT)
        .await
        .expect("rejected webhook should be dead-lettered");
    h.pool.stop().await.unwrap();

    assert_eq!(record.attempts, 1);
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 1);
    assert!(record.last_error.unwrap().contains("404"));

    let dead = drain_events(&mut rx)
        .into_iter()
        .find_map(|event| match event.payload {
            JobEventPayload::DeadLettered { reason, .. } => Some(reason),
            _ => None,
        });
    assert_eq!(dead.as_deref(), Some("non_retryable"));
}

#[tokio::test]
async fn test_ai_provider_timeout_is_retried_then_result_stored() {
    let generator = ScriptedTextGenerator::new("1. Reproduce the redirect\n2. Add a regression test")
        .then(Err(ProviderError::Timeout("deadline exceeded".into())));
    let fakes = FakeHandlers::build(&WebhookConfig::default(), generator).unwrap();
    let h = harness(fakes.registry.clone(), |b| b);

    let handle = h
        .store
        .enqueue(ai_job("task-42", AiAction::GenerateSuggestions))
        .await
        .unwrap();
    h.pool.start().await.unwrap();

    let record = wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("AI job should complete after one retry");
    h.pool.stop().await.unwrap();

    assert_eq!(record.attempts, 2);
    assert_eq!(fakes.generator.calls().len(), 2);

    let results = fakes.results.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, "task-42");
    assert_eq!(results[0].action, AiAction::GenerateSuggestions);
    assert_eq!(
        results[0].result,
        Value::String("1. Reproduce the redirect\n2. Add a regression test".into())
    );
    assert_eq!(fakes.activity.entries_for("ai_processed").len(), 1);
}

#[tokio::test]
async fn test_email_job_renders_template_and_logs_activity() {
    let fakes = FakeHandlers::build(&WebhookConfig::default(), ScriptedTextGenerator::new("ok")).unwrap();
    let h = harness(fakes.registry.clone(), |b| b);

    let handle = h.client.add_email_job(email_payload("ada@example.com")).await.unwrap();
    h.pool.start().await.unwrap();
    wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("email job should complete");
    h.pool.stop().await.unwrap();

    let sent = fakes.mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ada@example.com");
    assert!(sent[0].html.contains("Ada"));

    let activity = fakes.activity.entries_for("email_sent");
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].tenant_id, tenant());
    assert_eq!(activity[0].metadata["jobId"], handle.id.to_string());
}

#[tokio::test]
async fn test_email_transport_errors_are_retried_until_delivered() {
    let mail = RecordingMailTransport::failing_with([
        MailError::Transport("connection reset".into()),
        MailError::Rejected {
            status: 503,
            body: "try later".into(),
        },
    ]);
    let fakes = FakeHandlers::build_with_mail(
        &WebhookConfig::default(),
        ScriptedTextGenerator::new("ok"),
        mail,
    )
    .unwrap();
    let h = harness(fakes.registry.clone(), |b| b);

    let handle = h.client.add_email_job(email_payload("ada@example.com")).await.unwrap();
    h.pool.start().await.unwrap();
    wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("email job should complete after transport errors");
    h.pool.stop().await.unwrap();

    let job = h.store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(fakes.mail.sent().len(), 1);
    assert_eq!(fakes.activity.entries().len(), 1);
}

#[tokio::test]
async fn test_always_failing_job_dead_letters_after_max_attempts() {
    let dispatcher = Arc::new(MockDispatcher::with_result(DispatchStatus::Failed(
        JobError::transient("smtp connection refused"),
    )));
    let h = harness(dispatcher.clone(), |b| b);
    let mut rx = h.bus.subscribe_jobs();

    let handle = h
        .client
        .enqueue(email_job("ada@example.com").with_max_attempts(3))
        .await
        .unwrap();
    h.pool.start().await.unwrap();

    let record = wait_for_state(&*h.store, handle.id, JobState::DeadLetter, WAIT)
        .await
        .expect("job should be dead-lettered");
    h.pool.stop().await.unwrap();

    assert_eq!(record.attempts, 3);
    assert!(record.finished_at.is_some());
    assert!(record.last_error.unwrap().contains("smtp connection refused"));
    dispatcher.assert_dispatch_count_eq(3);

    let attempts: Vec<u16> = dispatcher.record().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let dead = wait_for_event(&mut rx, WAIT, |event| {
        matches!(event.payload, JobEventPayload::DeadLettered { .. })
    })
    .await
    .expect("dead-letter event");
    match dead.payload {
        JobEventPayload::DeadLettered { attempts, reason, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(reason, "exhausted");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_crashed_worker_lease_is_reaped_without_spending_attempt() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let h = harness(dispatcher.clone(), |b| b);

    let handle = h.store.enqueue(email_job("ada@example.com")).await.unwrap();

    // A worker that leases and then disappears.
    let leases = h
        .store
        .lease(LeaseRequest::new("crashed-worker", 1, ChronoDuration::milliseconds(20)))
        .await
        .unwrap();
    assert_eq!(leases.len(), 1);
    tokio::time::sleep(Duration::from_millis(60)).await;

    h.pool.run_housekeeping().await;
    let record = h.store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(record.attempts, 1);
    assert!(record.lease_id.is_none());

    // The crashed worker's lease can no longer settle the job.
    let stale = h.store.ack(handle.id, leases[0].lease_id).await.unwrap_err();
    assert!(matches!(
        stale.downcast_ref::<JobError>(),
        Some(JobError::LeaseExpired { .. })
    ));

    h.pool.start().await.unwrap();
    let record = wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("reaped job should be picked up again");
    h.pool.stop().await.unwrap();
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn test_rate_limit_holds_jobs_active_and_release_on_stop() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let h = harness(dispatcher.clone(), |b| {
        b.with_rate_limit(RateLimitConfig::new(2, Duration::from_secs(60)))
            .with_recheck_delay(Duration::from_millis(10))
    });

    let mut ids = Vec::new();
    for i in 0..5 {
        let handle = h
            .client
            .add_email_job(email_payload(&format!("user{i}@example.com")))
            .await
            .unwrap();
        ids.push(handle.id);
    }

    h.pool.start().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while dispatcher.dispatch_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    dispatcher.assert_dispatch_count_eq(2);

    h.pool.stop().await.unwrap();

    let mut completed = 0;
    for id in ids {
        let record = h.store.get(id).await.unwrap().unwrap();
        match record.state {
            JobState::Completed => completed += 1,
            JobState::Queued => assert_eq!(record.attempts, 0, "released jobs keep their attempts"),
            other => panic!("unexpected state {other}"),
        }
    }
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_job() {
    let dispatcher = Arc::new(MockDispatcher::new().with_delay(Duration::from_millis(200)));
    let h = harness(dispatcher.clone(), |b| b);

    let handle = h.store.enqueue(email_job("ada@example.com")).await.unwrap();
    h.pool.start().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while dispatcher.dispatch_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.pool.stop().await.unwrap();

    let record = h.store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
}

#[tokio::test]
async fn test_lower_priority_value_is_leased_first() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let h = harness(dispatcher.clone(), |b| {
        b.with_config(WorkerPoolConfig {
            concurrency: 1,
            batch_size: 1,
            ..fast_pool_config()
        })
    });

    h.store.enqueue(email_job("ada@example.com")).await.unwrap();
    h.store
        .enqueue(webhook_job("https://hooks.example.com/in"))
        .await
        .unwrap();
    h.store
        .enqueue(ai_job("task-1", AiAction::AutoCategorize))
        .await
        .unwrap();

    h.pool.start().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while dispatcher.dispatch_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.pool.stop().await.unwrap();

    let order: Vec<JobType> = dispatcher.record().iter().map(|r| r.job_type).collect();
    assert_eq!(order, vec![JobType::AiProcessing, JobType::Webhook, JobType::Email]);
}

#[tokio::test]
async fn test_requeued_dead_letter_runs_again() {
    let dispatcher = Arc::new(MockDispatcher::with_script([DispatchStatus::Failed(
        JobError::permanent("mailbox unavailable"),
    )]));
    let h = harness(dispatcher.clone(), |b| b);

    let handle = h.store.enqueue(email_job("ada@example.com")).await.unwrap();
    h.pool.start().await.unwrap();
    wait_for_state(&*h.store, handle.id, JobState::DeadLetter, WAIT)
        .await
        .expect("permanent failure dead-letters");

    h.store.requeue_dead_letter(handle.id).await.unwrap();
    let record = wait_for_state(&*h.store, handle.id, JobState::Completed, WAIT)
        .await
        .expect("requeued job completes");
    h.pool.stop().await.unwrap();

    assert_eq!(record.attempts, 1);
    dispatcher.assert_dispatch_count_eq(2);
}
