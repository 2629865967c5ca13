//! Runtime integration tests for the drover job queue.
//!
//! Drives a real `QueueRuntime` over the in-memory store: retries with
//! backoff, missing handlers, visibility reclaim after a crashed worker,
//! heartbeats keeping long jobs alive, priority ordering and shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drover::{
    BackoffPolicy, HandlerRegistry, InMemoryStore, JobError, JobPriority, JobStatus, JobStore,
    NewJob, QueueConfig, QueueRuntime, QueueRuntimeBuilder, WorkOutcome,
};
use drover_testkit::{
    AlwaysFailHandler, RecordingHandler, ScriptedHandler, SlowHandler, fast_config,
    init_test_tracing, wait_for_status,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

fn build_runtime(
    config: QueueConfig,
    store: Arc<InMemoryStore>,
    registry: HandlerRegistry,
) -> QueueRuntime {
    QueueRuntimeBuilder::new(config)
        .with_backend(store)
        .with_registry(registry)
        .build()
        .expect("runtime should build")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_handler_succeeds_on_third_attempt() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = ScriptedHandler::failing_times(2);
    let mut registry = HandlerRegistry::new();
    registry.register("x", handler.clone());

    let runtime = build_runtime(fast_config(), store, registry);
    runtime.start().await.unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("x", json!({"n": 1})).with_max_attempts(3))
        .await
        .unwrap();

    let done = wait_for_status(&client, job.id, JobStatus::Succeeded, WAIT)
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.result, Some(json!({"call": 3})));
    assert!(done.lock_owner.is_none());
    assert_eq!(handler.call_count(), 3);
    let attempts: Vec<u32> = handler.calls().iter().map(|c| c.attempts).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(runtime.dead_letters().count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregistered_type_fails_without_retry() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut registry = HandlerRegistry::new();
    registry.register("known", RecordingHandler::new());

    let runtime = build_runtime(fast_config(), store, registry);
    runtime.start().await.unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("y", json!({})).with_max_attempts(5))
        .await
        .unwrap();

    let failed = wait_for_status(&client, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap();
    // Give the worker a moment to finish writing the dead-letter record.
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(
        failed.error.as_ref().map(|e| e.code.as_str()),
        Some(JobError::INVALID_JOB_TYPE)
    );

    let records = runtime
        .dead_letters()
        .list(Default::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_job_id, job.id);
    assert_eq!(records[0].job_type, "y");
    assert_eq!(records[0].attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_move_job_to_dead_letter_queue() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = AlwaysFailHandler::new("smtp refused");
    let mut registry = HandlerRegistry::new();
    registry.register("send_email", handler.clone());

    let runtime = build_runtime(fast_config(), store, registry);
    runtime.start().await.unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("send_email", json!({"to": "a@example.com"})).with_max_attempts(2))
        .await
        .unwrap();

    let failed = wait_for_status(&client, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(failed.attempts, 2);
    assert_eq!(handler.call_count(), 2);
    let error = failed.error.unwrap();
    assert_eq!(error.code, JobError::HANDLER_ERROR);
    assert!(error.detail.contains("smtp refused"));

    let records = runtime
        .dead_letters()
        .list(Default::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error.as_ref().unwrap().code, JobError::HANDLER_ERROR);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backoff_spaces_out_attempts() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = AlwaysFailHandler::new("nope");
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", handler.clone());

    let config = QueueConfig {
        backoff: BackoffPolicy {
            base_ms: 100,
            factor: 2.0,
            max_ms: 1_000,
        },
        ..fast_config()
    };
    let runtime = build_runtime(config, store, registry);
    runtime.start().await.unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("flaky", json!({})).with_max_attempts(3))
        .await
        .unwrap();
    wait_for_status(&client, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].at.duration_since(calls[0].at);
    let second_gap = calls[2].at.duration_since(calls[1].at);
    assert!(first_gap >= Duration::from_millis(90), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(180), "second gap {second_gap:?}");
}

#[tokio::test]
async fn test_retry_delay_grows_geometrically_up_to_cap() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut registry = HandlerRegistry::new();
    registry.register("capped", AlwaysFailHandler::new("down"));

    let config = QueueConfig {
        backoff: BackoffPolicy {
            base_ms: 100,
            factor: 2.0,
            max_ms: 250,
        },
        ..fast_config()
    };
    let runtime = build_runtime(config, store.clone(), registry);
    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("capped", json!({})).with_max_attempts(4))
        .await
        .unwrap();
    let worker = runtime.worker("manual");

    for (attempt, expected_ms) in [(1, 100), (2, 200), (3, 250)] {
        let outcome = worker.run_once().await.unwrap().unwrap();
        let WorkOutcome::Retrying {
            job_id,
            attempts,
            delay,
        } = outcome
        else {
            panic!("attempt {attempt} should retry, got {outcome:?}");
        };
        assert_eq!(job_id, job.id);
        assert_eq!(attempts, attempt);
        assert_eq!(delay, Duration::from_millis(expected_ms));

        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(
            stored.available_at - stored.updated_at,
            chrono::Duration::milliseconds(expected_ms as i64)
        );

        // Not claimable before the delay elapses.
        assert!(worker.run_once().await.unwrap().is_none());
        tokio::time::sleep(delay + Duration::from_millis(20)).await;
    }

    let outcome = worker.run_once().await.unwrap().unwrap();
    assert!(
        matches!(outcome, WorkOutcome::Failed { attempts: 4, .. }),
        "{outcome:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_worker_job_is_reclaimed_after_visibility_timeout() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("report", handler.clone());

    let runtime = build_runtime(fast_config(), store.clone(), registry);
    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("report", json!({"month": "2026-09"})))
        .await
        .unwrap();

    // A worker that claims and then disappears without heartbeating.
    let claimed = store
        .claim_next("crashed-worker", Utc::now())
        .await
        .unwrap()
        .expect("job should be claimable");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.attempts, 1);

    runtime.start().await.unwrap();
    let done = wait_for_status(&client, job.id, JobStatus::Succeeded, WAIT)
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 2);
    assert_eq!(handler.call_count(), 1);
    assert_eq!(handler.calls()[0].attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_keeps_long_job_locked() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = SlowHandler::new(Duration::from_millis(1_500));
    let mut registry = HandlerRegistry::new();
    registry.register("transcode", handler.clone());

    // Lock expires after 500ms unless renewed every 100ms.
    let config = QueueConfig {
        concurrency: 3,
        ..fast_config()
    };
    let runtime = build_runtime(config, store, registry);
    runtime.start().await.unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("transcode", json!({"file": "a.mkv"})))
        .await
        .unwrap();

    let processing = wait_for_status(&client, job.id, JobStatus::Processing, WAIT)
        .await
        .unwrap();
    assert_eq!(processing.status, JobStatus::Processing);

    // Past the visibility timeout the lock must still be held by the same worker.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let midway = client.get_job(job.id).await.unwrap();
    assert_eq!(midway.status, JobStatus::Processing);
    assert_eq!(midway.attempts, 1);
    assert_eq!(midway.lock_owner, processing.lock_owner);
    assert!(midway.last_heartbeat_at.is_some());

    let done = wait_for_status(&client, job.id, JobStatus::Succeeded, WAIT)
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 1);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_claims_by_priority() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("index", handler.clone());

    let config = QueueConfig {
        concurrency: 1,
        ..fast_config()
    };
    let runtime = build_runtime(config, store, registry);
    let client = runtime.client();

    let low = client
        .enqueue(NewJob::new("index", json!({"tier": "low"})).with_priority(JobPriority::LOW))
        .await
        .unwrap();
    client
        .enqueue(NewJob::new("index", json!({"tier": "normal"})))
        .await
        .unwrap();
    client
        .enqueue(NewJob::new("index", json!({"tier": "high"})).with_priority(JobPriority::HIGH))
        .await
        .unwrap();

    runtime.start().await.unwrap();
    wait_for_status(&client, low.id, JobStatus::Succeeded, WAIT)
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    let order: Vec<String> = handler
        .calls()
        .iter()
        .map(|c| c.payload["tier"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(order, vec!["high", "normal", "low"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_job_handled_once_under_concurrency() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("thumbnail", handler.clone());

    let config = QueueConfig {
        concurrency: 4,
        ..fast_config()
    };
    let runtime = build_runtime(config, store, registry);
    let client = runtime.client();

    let mut ids = Vec::new();
    for i in 0..40 {
        let job = client
            .enqueue(NewJob::new("thumbnail", json!({"image": i})))
            .await
            .unwrap();
        ids.push(job.id);
    }

    runtime.start().await.unwrap();
    for id in &ids {
        let job = wait_for_status(&client, *id, JobStatus::Succeeded, WAIT)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
    }
    runtime.shutdown().await.unwrap();

    let seen: HashSet<_> = handler.calls().iter().map(|c| c.job_id).collect();
    assert_eq!(handler.call_count(), 40);
    assert_eq!(seen.len(), 40);

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.totals().succeeded, 40);
    assert_eq!(snapshot.totals().queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_stops_claiming() {
    init_test_tracing();
    let store = Arc::new(InMemoryStore::new());
    let handler = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("noop", handler.clone());

    let runtime = build_runtime(fast_config(), store, registry);
    runtime.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown should complete")
        .unwrap();

    let client = runtime.client();
    let job = client
        .enqueue(NewJob::new("noop", json!({})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = client.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(handler.call_count(), 0);
}
