use std::sync::Once;
use std::time::{Duration, Instant};

use drover::{BackoffPolicy, Job, JobClient, JobId, JobStatus, QueueConfig};

/// Config tuned for tests: short polls, short locks, no backoff.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        idle_poll_interval_ms: 10,
        visibility_timeout_ms: 500,
        heartbeat_interval_ms: 100,
        backoff: BackoffPolicy {
            base_ms: 0,
            factor: 2.0,
            max_ms: 0,
        },
        dlq_retention_days: None,
        shutdown_timeout_ms: 2_000,
        worker_prefix: "test".to_string(),
        ..Default::default()
    }
}

/// Poll until the job reaches `status` or `timeout` elapses.
///
/// Returns the last observed job either way so callers can assert on it.
pub async fn wait_for_status(
    client: &JobClient,
    id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> anyhow::Result<Job> {
    let deadline = Instant::now() + timeout;
    loop {
        let job = client.get_job(id).await?;
        if job.status == status || Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

static TRACING: Once = Once::new();

/// Install a test-writer subscriber honoring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
