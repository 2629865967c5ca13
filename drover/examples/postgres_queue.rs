//! PostgreSQL queue example demonstrating durable job processing.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb drover_example`
//!
//! The schema is applied on startup through the embedded migrations.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/drover_example"
//! cargo run --example postgres_queue --features postgres
//! ```
//!
//! Any `DROVER_*` variable overrides the queue settings, for example
//! `DROVER_CONCURRENCY=8` or `DROVER_BACKOFF__BASE_MS=500`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use drover::*;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover=info".into()),
        )
        .init();

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = PersistenceConfig::new(database_url).connect().await?;
    let store = Arc::new(PostgresStore::new(pool));
    store.migrate().await?;

    let config = QueueConfig::load()?;

    let mut registry = HandlerRegistry::new();
    registry.register("generate_report", |job: Job| async move {
        let account = job.payload["account"].as_i64().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(250)).await;
        anyhow::Ok(json!({ "account": account, "pages": 12 }))
    });

    let runtime = QueueRuntimeBuilder::new(config)
        .with_backend(store)
        .with_registry(registry)
        .build()?;
    runtime.start().await?;

    let client = runtime.client();
    let mut ids = Vec::new();
    for account in 1..=5 {
        match client
            .enqueue(NewJob::new("generate_report", json!({ "account": account })))
            .await
        {
            Ok(job) => ids.push(job.id),
            Err(QueueError::Conflict { .. }) => {
                println!("report for account {account} already pending");
            }
            Err(err) => return Err(err.into()),
        }
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    for id in ids {
        let job = client.get_job(id).await?;
        println!("{} status={} attempts={}", job.id, job.status, job.attempts);
    }

    let snapshot = client.snapshot().await?;
    for (job_type, entry) in &snapshot.by_type {
        println!("{job_type}: {entry:?}");
    }

    runtime.shutdown().await
}
