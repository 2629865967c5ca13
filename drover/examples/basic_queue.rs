//! Basic queue example using the in-memory store.
//!
//! Registers two handlers, submits a handful of jobs (one of them flaky and
//! one with no handler), then prints the final state and dead-letter queue.
//!
//! ```bash
//! RUST_LOG=drover=info cargo run --example basic_queue
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use drover::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut registry = HandlerRegistry::new();
    registry.register("resize_image", |job: Job| async move {
        let width = job.payload["width"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        anyhow::Ok(json!({ "resized_to": width / 2 }))
    });

    let calls = Arc::new(AtomicU32::new(0));
    let flaky_calls = Arc::clone(&calls);
    registry.register("notify_webhook", move |_job: Job| {
        let calls = Arc::clone(&flaky_calls);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("webhook returned 503");
            }
            anyhow::Ok(json!({ "status": 200 }))
        }
    });

    let config = QueueConfig {
        concurrency: 2,
        idle_poll_interval_ms: 100,
        backoff: BackoffPolicy {
            base_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };

    let runtime = QueueRuntimeBuilder::new(config)
        .with_backend(Arc::new(InMemoryStore::new()))
        .with_registry(registry)
        .build()?;
    runtime.start().await?;

    let client = runtime.client();
    let mut ids = Vec::new();
    for width in [640, 1280, 1920] {
        let job = client
            .enqueue(NewJob::new("resize_image", json!({ "width": width })))
            .await?;
        ids.push(job.id);
    }
    ids.push(
        client
            .enqueue(
                NewJob::new("notify_webhook", json!({ "url": "https://example.com/hook" }))
                    .with_priority(JobPriority::HIGH),
            )
            .await?
            .id,
    );
    ids.push(
        client
            .enqueue(NewJob::new("archive_logs", json!({ "day": "2026-10-18" })))
            .await?
            .id,
    );

    // Submitting the same work twice while the first copy is live is rejected.
    match client
        .enqueue(NewJob::new("resize_image", json!({ "width": 640 })))
        .await
    {
        Err(QueueError::Conflict { .. }) => println!("duplicate resize rejected"),
        other => println!("unexpected duplicate result: {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    for id in ids {
        let job = client.get_job(id).await?;
        println!(
            "{} {:<15} status={:<10} attempts={} result={}",
            job.id,
            job.job_type,
            job.status,
            job.attempts,
            job.result.unwrap_or_default()
        );
    }

    for record in runtime.dead_letters().list(DeadLetterFilter::default()).await? {
        println!(
            "dead letter {} type={} error={}",
            record.id,
            record.job_type,
            record.error.map(|e| e.to_string()).unwrap_or_default()
        );
    }

    let snapshot = client.snapshot().await?;
    println!("totals: {:?}, dead letters: {}", snapshot.totals(), snapshot.dead_letters);

    runtime.shutdown().await
}
