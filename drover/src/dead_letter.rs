use std::fmt::{self, Display};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::client::JobClient;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobError, JobId, JobPriority, NewJob};
use crate::store::DeadLetterStore;
use crate::telemetry;

/// Unique identifier for a dead-letter record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterId {
    /// Create a new dead-letter ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a job that exhausted its attempts.
///
/// Owned independently of the original job, which stays `failed` in the job
/// store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    /// Record id, independent of the job id.
    pub id: DeadLetterId,
    /// The failed job this record was copied from; lookup only.
    pub original_job_id: JobId,
    /// Handler name copied from the job.
    pub job_type: String,
    /// Payload copied verbatim.
    pub payload: serde_json::Value,
    /// Priority copied from the job.
    pub priority: JobPriority,
    /// Claims spent before failing.
    pub attempts: u32,
    /// Attempt budget of the failed job.
    pub max_attempts: u32,
    /// Last recorded failure.
    pub error: Option<JobError>,
    /// When the original job was enqueued.
    pub original_created_at: DateTime<Utc>,
    /// When the record was written.
    pub moved_to_dlq_at: DateTime<Utc>,
    /// How many times the record has been re-enqueued.
    pub retry_count: u32,
    /// Time of the latest re-enqueue, if any.
    pub last_retried_at: Option<DateTime<Utc>>,
}

impl DeadLetterJob {
    /// Copy a failed job into a new record.
    pub fn from_failed(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            error: job.error.clone(),
            original_created_at: job.created_at,
            moved_to_dlq_at: now,
            retry_count: 0,
            last_retried_at: None,
        }
    }
}

/// Filter for listing dead-letter records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    /// Only records of this type.
    pub job_type: Option<String>,
    /// Page size; clamped to [`DeadLetterFilter::MAX_LIMIT`].
    pub limit: Option<usize>,
    /// Records to skip.
    pub offset: Option<usize>,
}

impl DeadLetterFilter {
    /// Page size when none is given.
    pub const DEFAULT_LIMIT: usize = 50;
    /// Largest page a caller may request.
    pub const MAX_LIMIT: usize = 1000;

    /// Restrict to one job type.
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Set the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the number of records to skip.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Requested limit, defaulted and clamped.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    /// Requested offset, defaulting to zero.
    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    /// Whether `record` passes the type filter.
    pub fn matches(&self, record: &DeadLetterJob) -> bool {
        self.job_type
            .as_deref()
            .is_none_or(|job_type| record.job_type == job_type)
    }
}

/// Result of re-enqueuing a dead-letter record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRetry {
    /// The record after its retry count was bumped.
    pub dead_letter: DeadLetterJob,
    /// Identity of the freshly enqueued job.
    pub new_job_id: JobId,
}

/// Operations on the dead-letter store.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    client: JobClient,
}

impl DeadLetterQueue {
    /// `client` is used to re-enqueue records on [`DeadLetterQueue::retry`].
    pub fn new(store: Arc<dyn DeadLetterStore>, client: JobClient) -> Self {
        Self { store, client }
    }

    /// Copy a terminally failed job into the dead-letter store.
    pub async fn move_job(&self, job: &Job) -> QueueResult<DeadLetterJob> {
        let record = DeadLetterJob::from_failed(job, Utc::now());
        let record = self
            .store
            .insert_dead_letter(record)
            .instrument(telemetry::dlq_span("move"))
            .await?;

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            dead_letter_id = %record.id,
            error_code = job.error.as_ref().map(|e| e.code.as_str()).unwrap_or(""),
            "job moved to dead-letter queue"
        );
        Ok(record)
    }

    /// Records newest first. The limit defaults to 50 and is capped at 1000.
    pub async fn list(&self, filter: DeadLetterFilter) -> QueueResult<Vec<DeadLetterJob>> {
        self.store.list_dead_letters(&filter).await
    }

    /// Fetch a record, failing with `DeadLetterNotFound` if it is gone.
    pub async fn get(&self, id: DeadLetterId) -> QueueResult<DeadLetterJob> {
        self.store
            .find_dead_letter(id)
            .await?
            .ok_or(QueueError::DeadLetterNotFound(id))
    }

    /// Re-enqueue a record as a brand new job.
    ///
    /// The retry count is only bumped once the enqueue succeeds; a
    /// [`QueueError::Conflict`] leaves the record untouched.
    pub async fn retry(&self, id: DeadLetterId) -> QueueResult<DeadLetterRetry> {
        async move {
            let record = self.get(id).await?;

            let job = self
                .client
                .enqueue(
                    NewJob::new(record.job_type.clone(), record.payload.clone())
                        .with_priority(record.priority)
                        .with_max_attempts(record.max_attempts),
                )
                .await?;

            let dead_letter = self
                .store
                .increment_retry_count(id, Utc::now())
                .await?
                .ok_or(QueueError::DeadLetterNotFound(id))?;

            info!(
                dead_letter_id = %id,
                new_job_id = %job.id,
                retry_count = dead_letter.retry_count,
                "dead-letter record re-enqueued"
            );

            Ok(DeadLetterRetry {
                dead_letter,
                new_job_id: job.id,
            })
        }
        .instrument(telemetry::dlq_span("retry"))
        .await
    }

    /// Remove a record for good.
    pub async fn delete(&self, id: DeadLetterId) -> QueueResult<()> {
        let deleted = self
            .store
            .delete_dead_letter(id)
            .instrument(telemetry::dlq_span("delete"))
            .await?;
        if deleted {
            info!(dead_letter_id = %id, "dead-letter record deleted");
            Ok(())
        } else {
            Err(QueueError::DeadLetterNotFound(id))
        }
    }

    /// Remove records moved more than `retention_days` ago.
    ///
    /// A retention window reaching past the representable time range removes
    /// nothing.
    pub async fn prune(&self, retention_days: u32) -> QueueResult<u64> {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            debug!(retention_days, "retention window exceeds time range, nothing to prune");
            return Ok(0);
        };
        let removed = self
            .store
            .delete_dead_letters_before(cutoff)
            .instrument(telemetry::dlq_span("prune"))
            .await?;
        telemetry::record_dead_letters_pruned(removed, retention_days);
        Ok(removed)
    }

    /// Records currently held.
    pub async fn count(&self) -> QueueResult<u64> {
        self.store.count_dead_letters().await
    }
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
