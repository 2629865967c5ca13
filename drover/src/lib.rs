//! Drover - a durable, at-least-once background job queue.
//!
//! Producers submit typed jobs with JSON payloads; a pool of workers claims
//! them one at a time under a visibility timeout, runs the registered handler
//! and records the outcome. Failed jobs are retried with exponential backoff
//! until their attempts are exhausted, at which point they are copied into a
//! dead-letter queue for inspection, manual retry or deletion.
//!
//! # Core Concepts
//!
//! - **Job**: A [`Job`] document carries its type, payload, status, attempt
//!   counters, lock fields and outcome. Jobs are submitted through
//!   [`JobClient::enqueue`] as a [`NewJob`].
//!
//! - **Store**: The [`JobStore`] and [`DeadLetterStore`] traits abstract the
//!   backend. Claiming is a single atomic conditional update so that no two
//!   workers ever hold the same job. [`InMemoryStore`] ships by default and a
//!   PostgreSQL backend is available behind the `postgres` feature.
//!
//! - **Handlers**: The [`HandlerRegistry`] maps a job type string to a
//!   [`JobHandler`]. Any `Fn(Job) -> impl Future<Output = anyhow::Result<Value>>`
//!   is a handler.
//!
//! - **Runtime**: The [`QueueRuntime`] spawns [`Worker`]s that release stuck
//!   jobs, claim, heartbeat and finalize, plus a housekeeper that prunes old
//!   dead-letter records.
//!
//! - **Idempotency**: Every job carries a fingerprint of its type and
//!   canonicalized payload; a second live submission of the same work is
//!   rejected with [`QueueError::Conflict`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use drover::*;
//! use serde_json::json;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let mut registry = HandlerRegistry::new();
//! registry.register("send_email", |job: Job| async move {
//!     let to = job.payload["to"].as_str().unwrap_or_default().to_string();
//!     anyhow::Ok(json!({ "delivered_to": to }))
//! });
//!
//! let runtime = QueueRuntimeBuilder::new(QueueConfig::default())
//!     .with_backend(store)
//!     .with_registry(registry)
//!     .build()?;
//! runtime.start().await?;
//!
//! runtime
//!     .client()
//!     .enqueue(NewJob::new("send_email", json!({ "to": "a@example.com" })))
//!     .await?;
//! ```

/// Client for submitting and inspecting jobs.
///
/// The `client` module provides [`JobClient`], which validates submissions,
/// computes the idempotency fingerprint and reads job state.
pub mod client;

/// Configuration structures for queue and persistence settings.
///
/// The `config` module defines [`QueueConfig`] and [`PersistenceConfig`],
/// loadable from environment variables prefixed with `DROVER_` or TOML.
pub mod config;

/// Dead-letter queue.
///
/// The `dead_letter` module provides [`DeadLetterJob`] records and the
/// [`DeadLetterQueue`] service for listing, retrying, deleting and pruning
/// them.
pub mod dead_letter;

/// Error types shared across the crate.
pub mod error;

/// Idempotency fingerprint over job type and canonicalized payload.
pub mod fingerprint;

/// Core job definitions.
///
/// The `job` module defines the job document and its value types:
/// - [`Job`] - the persisted job document
/// - [`JobId`] - unique job identifier
/// - [`JobStatus`] - `queued`, `processing`, `succeeded`, `failed`
/// - [`JobPriority`] - lower values are claimed first
/// - [`JobError`] - structured error recorded on a job
/// - [`NewJob`] and [`JobFilter`] - submission and listing inputs
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus collectors for queue activity.
pub mod metrics;

/// Storage backends.
///
/// The `persistence` module provides [`InMemoryStore`] and, with the
/// `postgres` feature, `PostgresStore`.
pub mod persistence;

/// Handler registry mapping job types to handlers.
pub mod registry;

/// Retry backoff policy and the failure decision.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides the [`QueueRuntime`] for managing the worker
/// pool and dead-letter housekeeping. Includes:
/// - [`QueueRuntime`] - main runtime type
/// - [`QueueRuntimeBuilder`] - builder validating dependencies
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`Worker`] and [`WorkOutcome`] - a single consumer and its iteration result
pub mod runtime;

/// Storage traits for jobs and dead-letter records.
///
/// The `store` module defines [`JobStore`], [`DeadLetterStore`] and the
/// [`QueueSnapshot`] used for monitoring queue depth.
pub mod store;

/// Tracing spans and lifecycle recording helpers.
pub mod telemetry;

pub use client::*;
pub use self::config::*;
pub use dead_letter::*;
pub use error::*;
pub use fingerprint::*;
pub use job::*;
pub use persistence::*;
pub use registry::*;
pub use retry::*;
pub use runtime::*;
pub use store::*;
