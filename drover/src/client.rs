use std::sync::Arc;

use chrono::Utc;
use tracing::{Instrument, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::fingerprint::idempotency_key;
use crate::job::{Job, JobFilter, JobId, NewJob};
use crate::store::{DeadLetterStore, JobStore, QueueSnapshot};
use crate::telemetry;

/// Submission and read API over a job store.
///
/// Cheap to clone; every clone shares the same store handles.
#[derive(Clone)]
pub struct JobClient {
    store: Arc<dyn JobStore>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    config: Arc<QueueConfig>,
}

impl JobClient {
    /// Create a client over `store`.
    pub fn new(store: Arc<dyn JobStore>, config: Arc<QueueConfig>) -> Self {
        Self {
            store,
            dead_letters: None,
            config,
        }
    }

    /// Include the dead-letter count in [`JobClient::snapshot`].
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Configuration jobs are stamped from.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate and insert a new `queued` job.
    ///
    /// A job with the same type and payload as an existing non-failed job is
    /// rejected with [`QueueError::Conflict`].
    pub async fn enqueue(&self, request: NewJob) -> QueueResult<Job> {
        let priority = request.priority.unwrap_or_default();
        let span = telemetry::enqueue_span(&request.job_type, priority);

        async move {
            let job = self.build_job(request)?;
            let job = self.store.insert(job).await.inspect_err(|err| {
                if matches!(err, QueueError::Conflict { .. }) {
                    warn!(error = %err, "rejected duplicate job");
                }
            })?;

            telemetry::record_job_enqueued(job.id, &job.job_type);
            Ok(job)
        }
        .instrument(span)
        .await
    }

    fn build_job(&self, request: NewJob) -> QueueResult<Job> {
        let job_type = request.job_type.trim();
        if job_type.is_empty() {
            return Err(QueueError::InvalidJobType(
                "job type must not be empty".to_string(),
            ));
        }
        if !request.payload.is_object() {
            return Err(QueueError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidPayload(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let key = idempotency_key(job_type, &request.payload);
        let mut job = Job::queued(job_type, request.payload, Utc::now());
        job.max_attempts = max_attempts;
        job.priority = request.priority.unwrap_or_default();
        job.visibility_timeout_ms = self.config.visibility_timeout_ms;
        job.idempotency_key = Some(key);
        Ok(job)
    }

    /// Fetch a job, failing with `JobNotFound` if it does not exist.
    pub async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.store
            .find(id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Jobs matching `filter`, newest first. The limit defaults to 100 and
    /// is capped at 1000.
    pub async fn list_jobs(&self, filter: JobFilter) -> QueueResult<Vec<Job>> {
        self.store.list(&filter).await
    }

    /// Per-type counts plus the dead-letter total.
    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        let mut snapshot = self.store.snapshot(Utc::now()).await?;
        if let Some(dead_letters) = &self.dead_letters {
            snapshot.dead_letters = dead_letters.count_dead_letters().await?;
        }
        Ok(snapshot)
    }
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("dead_letters_set", &self.dead_letters.is_some())
            .field("config", &self.config)
            .finish()
    }
}
