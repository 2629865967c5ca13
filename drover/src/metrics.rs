//! Prometheus metrics instrumentation for drover.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `drover_jobs_enqueued_total` - Jobs accepted by the enqueue API
//! - `drover_jobs_finalized_total` - Attempt outcomes (succeeded, retrying, failed, lock_lost)
//! - `drover_stuck_jobs_released_total` - Jobs released by unstick passes
//! - `drover_dead_letters_pruned_total` - Dead-letter records removed by retention
//!
//! ## Histograms
//! - `drover_job_duration_seconds` - Handler execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for drover metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs enqueued.
///
/// Labels:
/// - `job_type`: The job type
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("drover_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["job_type"]).expect("drover_jobs_enqueued_total metric creation failed")
});

/// Counter for attempt outcomes.
///
/// Labels:
/// - `job_type`: The job type
/// - `status`: succeeded, retrying, failed or lock_lost
pub static JOBS_FINALIZED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_jobs_finalized_total",
        "Total number of job attempts finalized",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("drover_jobs_finalized_total metric creation failed")
});

/// Counter for jobs released from an expired lock.
pub static STUCK_JOBS_RELEASED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drover_stuck_jobs_released_total",
        "Total number of jobs released after their visibility timeout",
    )
    .expect("drover_stuck_jobs_released_total metric creation failed")
});

/// Counter for dead-letter records removed by retention.
pub static DEAD_LETTERS_PRUNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drover_dead_letters_pruned_total",
        "Total number of dead-letter records pruned",
    )
    .expect("drover_dead_letters_pruned_total metric creation failed")
});

/// Histogram for handler execution duration in seconds.
///
/// Labels:
/// - `job_type`: The job type
/// - `status`: The attempt outcome
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "drover_job_duration_seconds",
        "Job handler duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("drover_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent; calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINALIZED_TOTAL.clone()),
        Box::new(STUCK_JOBS_RELEASED_TOTAL.clone()),
        Box::new(DEAD_LETTERS_PRUNED_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Count an accepted enqueue.
pub fn record_job_enqueued(job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[job_type]).inc();
}

/// Count a job reaching `status`.
pub fn record_job_finalized(job_type: &str, status: &str) {
    JOBS_FINALIZED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

/// Count jobs released by an unstick pass.
pub fn record_stuck_released(count: u64) {
    STUCK_JOBS_RELEASED_TOTAL.inc_by(count);
}

/// Count dead-letter records removed by retention.
pub fn record_dead_letters_pruned(count: u64) {
    DEAD_LETTERS_PRUNED_TOTAL.inc_by(count);
}

/// Record handler wall time.
pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
