use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dead_letter::{DeadLetterFilter, DeadLetterId, DeadLetterJob};
use crate::error::QueueResult;
use crate::job::{Job, JobError, JobFilter, JobId, JobStatus};

/// Trait for backends that persist job documents.
///
/// Every mutating call that releases or renews a lock is a single
/// conditional update guarded by `lock_owner == worker_id`; a `false` or
/// `None` return means the caller no longer owns the job and nothing was
/// written.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly built job.
    ///
    /// Fails with `QueueError::Conflict` when another job already holds the
    /// same idempotency key.
    async fn insert(&self, job: Job) -> QueueResult<Job>;

    /// Fetch a job by id.
    async fn find(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// List jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>>;

    /// Atomically claim the next claimable job for `worker_id`.
    ///
    /// Picks the `queued` job with `available_at <= now` ordered by
    /// `(priority, available_at, created_at)`, moves it to `processing`,
    /// stamps the lock and increments `attempts`.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Refresh `locked_at` and `last_heartbeat_at` if `worker_id` still holds the lock.
    async fn heartbeat(&self, id: JobId, worker_id: &str, now: DateTime<Utc>)
    -> QueueResult<bool>;

    /// Record success, store `result` and release the lock.
    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Return the job to `queued` until `available_at`, keeping `error`.
    async fn mark_retry(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Move the job to terminal `failed` and release its idempotency key.
    ///
    /// Returns the updated document so it can be copied into the
    /// dead-letter store.
    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Release every `processing` job whose lock outlived its visibility timeout.
    ///
    /// Jobs with attempts left go back to `queued`; jobs that already spent
    /// their budget are failed with `VISIBILITY_TIMEOUT` and returned in
    /// [`StuckRelease::exhausted`].
    async fn release_stuck(&self, now: DateTime<Utc>) -> QueueResult<StuckRelease>;

    /// Per-type status counts.
    async fn snapshot(&self, now: DateTime<Utc>) -> QueueResult<QueueSnapshot>;
}

/// Trait for backends that keep dead-letter records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store a new record.
    async fn insert_dead_letter(&self, record: DeadLetterJob) -> QueueResult<DeadLetterJob>;

    /// Fetch a record by id.
    async fn find_dead_letter(&self, id: DeadLetterId) -> QueueResult<Option<DeadLetterJob>>;

    /// Records matching `filter`, newest `moved_to_dlq_at` first.
    async fn list_dead_letters(&self, filter: &DeadLetterFilter)
    -> QueueResult<Vec<DeadLetterJob>>;

    /// Bump `retry_count` and stamp `last_retried_at`; `None` if the record is gone.
    async fn increment_retry_count(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<DeadLetterJob>>;

    /// Delete a record; `false` if it did not exist.
    async fn delete_dead_letter(&self, id: DeadLetterId) -> QueueResult<bool>;

    /// Remove records moved before `cutoff`, returning how many were removed.
    async fn delete_dead_letters_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64>;

    /// Number of records held.
    async fn count_dead_letters(&self) -> QueueResult<u64>;
}

/// Outcome of an unstick pass.
#[derive(Clone, Debug, Default)]
pub struct StuckRelease {
    /// Jobs returned to `queued`.
    pub requeued: u64,
    /// Jobs failed because their last attempt timed out.
    pub exhausted: Vec<Job>,
}

impl StuckRelease {
    /// Whether the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.exhausted.is_empty()
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-job-type counts.
    pub by_type: HashMap<String, QueueSnapshotEntry>,
    /// Records currently in the dead-letter store.
    pub dead_letters: u64,
}

impl QueueSnapshot {
    /// Create an empty snapshot at the given time.
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            by_type: HashMap::new(),
            dead_letters: 0,
        }
    }

    /// Get or create the entry for a job type.
    pub fn entry_mut(&mut self, job_type: &str) -> &mut QueueSnapshotEntry {
        self.by_type.entry(job_type.to_string()).or_default()
    }

    /// Sum of all per-type entries.
    pub fn totals(&self) -> QueueSnapshotEntry {
        self.by_type
            .values()
            .fold(QueueSnapshotEntry::default(), |mut acc, entry| {
                acc.queued += entry.queued;
                acc.processing += entry.processing;
                acc.succeeded += entry.succeeded;
                acc.failed += entry.failed;
                acc.total += entry.total;
                acc
            })
    }
}

/// Statistics for a single job type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Jobs waiting to be claimed.
    pub queued: u64,
    /// Jobs currently locked by a worker.
    pub processing: u64,
    /// Jobs that completed.
    pub succeeded: u64,
    /// Jobs that exhausted their attempts.
    pub failed: u64,
    /// All jobs of this type.
    pub total: u64,
}

impl QueueSnapshotEntry {
    /// Add `count` jobs in `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}
