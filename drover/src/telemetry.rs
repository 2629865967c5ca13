//! Tracing and telemetry instrumentation for drover.
//!
//! Helpers for creating tracing spans and recording job lifecycle events.
//! All functions work both with and without the `metrics` feature flag; with
//! it enabled, the `record_*` helpers also update the Prometheus collectors in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use drover::telemetry::{dispatch_span, record_job_start, record_job_end};
//!
//! let span = dispatch_span(job.id, &job.job_type, job.attempts);
//! let timing = record_job_start(job.id);
//! // ... run the handler inside the span
//! record_job_end(timing, &job.job_type, "succeeded");
//! ```

use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{Span, info_span};

/// Create a span for a submission.
#[must_use]
pub fn enqueue_span(job_type: impl AsRef<str>, priority: impl Display) -> Span {
    info_span!(
        "drover.enqueue",
        job_type = %job_type.as_ref(),
        priority = %priority,
    )
}

/// Create a span covering one unstick + claim round of a worker.
#[must_use]
pub fn claim_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("drover.claim", worker_id = %worker_id.as_ref())
}

/// Create a span for running a claimed job's handler.
///
/// The span includes the job_id, job_type and attempt number as fields.
#[must_use]
pub fn dispatch_span(job_id: impl Display, job_type: impl AsRef<str>, attempts: u32) -> Span {
    info_span!(
        "drover.dispatch",
        job_id = %job_id,
        job_type = %job_type.as_ref(),
        attempts = attempts,
    )
}

/// Create a span for recording a job's outcome.
#[must_use]
pub fn finalize_span(job_id: impl Display, job_type: impl AsRef<str>, attempts: u32) -> Span {
    info_span!(
        "drover.finalize",
        job_id = %job_id,
        job_type = %job_type.as_ref(),
        attempts = attempts,
    )
}

/// Create a span for the heartbeat task of a running job.
#[must_use]
pub fn heartbeat_span(job_id: impl Display, worker_id: impl AsRef<str>) -> Span {
    info_span!(
        "drover.heartbeat",
        job_id = %job_id,
        worker_id = %worker_id.as_ref(),
    )
}

/// Create a span for a dead-letter operation (`move`, `retry`, `delete`, `prune`).
#[must_use]
pub fn dlq_span(operation: &'static str) -> Span {
    info_span!("drover.dlq", operation = operation)
}

/// Record a successful submission.
pub fn record_job_enqueued(job_id: impl Display, job_type: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id,
        job_type = %job_type.as_ref(),
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(job_type.as_ref());
}

/// Record the outcome of an attempt.
///
/// `status` is one of `succeeded`, `retrying`, `failed` or `lock_lost`.
pub fn record_job_finalized(
    job_id: impl Display,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    tracing::info!(
        job_id = %job_id,
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        "job finalized"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finalized(job_type.as_ref(), status.as_ref());
}

/// Record the result of an unstick pass.
pub fn record_stuck_released(worker_id: impl AsRef<str>, requeued: u64, exhausted: u64) {
    tracing::warn!(
        worker_id = %worker_id.as_ref(),
        requeued,
        exhausted,
        "released jobs with expired locks"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stuck_released(requeued + exhausted);
}

/// Record a dead-letter pruning run.
pub fn record_dead_letters_pruned(removed: u64, retention_days: u32) {
    if removed > 0 {
        tracing::info!(removed, retention_days, "pruned dead-letter records");
    } else {
        tracing::debug!(retention_days, "no dead-letter records to prune");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_dead_letters_pruned(removed);
}

/// Observe the duration of a handler run.
pub fn observe_job_duration(job_type: impl AsRef<str>, status: impl AsRef<str>, duration: Duration) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        duration_ms = duration.as_millis() as u64,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(
        job_type.as_ref(),
        status.as_ref(),
        duration.as_secs_f64(),
    );
}

/// Start timing a handler run; pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl Display) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.to_string(),
        start: Instant::now(),
    }
}

/// Finish timing a handler run and observe its duration.
pub fn record_job_end(handle: JobTimingHandle, job_type: impl AsRef<str>, status: impl AsRef<str>) {
    observe_job_duration(job_type, status, handle.elapsed());
}

/// Handle for tracking handler execution duration.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: Instant,
}

impl JobTimingHandle {
    /// Get the job ID associated with this timing handle.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the elapsed time since the handler started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
