use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    /// Create a new job ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Lower values are claimed first.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

impl JobPriority {
    /// Served ahead of the normal tier.
    pub const HIGH: JobPriority = JobPriority(1);
    /// Default tier for enqueued jobs.
    pub const NORMAL: JobPriority = JobPriority(5);
    /// Served after the normal tier.
    pub const LOW: JobPriority = JobPriority(10);

    /// Raw integer value as stored.
    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job document.
///
/// `Queued` and `Processing` are the only non-terminal states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed once `available_at` has passed.
    Queued,
    /// Claimed and locked by a worker.
    Processing,
    /// The handler returned a result.
    Succeeded,
    /// Attempts exhausted or the job type has no handler.
    Failed,
}

impl JobStatus {
    /// All states, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    /// Stable string form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible for this document.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// Structured failure information stored on a job.
///
/// Handlers may return this through `anyhow` to control the stored code and
/// title; any other error is wrapped as [`JobError::HANDLER_ERROR`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {title}")]
pub struct JobError {
    /// Machine-readable code such as `HANDLER_ERROR`.
    pub code: String,
    /// Short summary.
    pub title: String,
    /// Full error chain or panic message.
    pub detail: String,
}

impl JobError {
    /// Handler returned an error.
    pub const HANDLER_ERROR: &'static str = "HANDLER_ERROR";
    /// Handler panicked while running.
    pub const HANDLER_PANIC: &'static str = "HANDLER_PANIC";
    /// No handler registered for the job type.
    pub const INVALID_JOB_TYPE: &'static str = "INVALID_JOB_TYPE";
    /// Lock expired after the final attempt.
    pub const VISIBILITY_TIMEOUT: &'static str = "VISIBILITY_TIMEOUT";

    /// Build an error from its parts.
    pub fn new(
        code: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            detail: detail.into(),
        }
    }

    /// Error recorded when dispatch finds no handler for `job_type`.
    pub fn invalid_job_type(job_type: &str) -> Self {
        Self::new(
            Self::INVALID_JOB_TYPE,
            "Invalid job type",
            format!("no handler registered for job type '{job_type}'"),
        )
    }

    /// Convert a handler error, keeping a structured [`JobError`] if the
    /// handler produced one.
    pub fn from_handler(err: &anyhow::Error) -> Self {
        if let Some(job_error) = err.downcast_ref::<JobError>() {
            return job_error.clone();
        }
        Self::new(Self::HANDLER_ERROR, "Job handler failed", format!("{err:#}"))
    }

    /// Error recorded when a handler panics.
    pub fn handler_panic(message: impl Into<String>) -> Self {
        Self::new(Self::HANDLER_PANIC, "Job handler panicked", message)
    }

    /// Error recorded when the final attempt's lock expires unrenewed.
    pub fn visibility_timeout(worker_id: Option<&str>) -> Self {
        Self::new(
            Self::VISIBILITY_TIMEOUT,
            "Visibility timeout expired",
            format!(
                "lock held by {} expired on the final attempt",
                worker_id.unwrap_or("unknown worker")
            ),
        )
    }
}

/// A unit of work persisted in the job store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// System-generated identifier.
    pub id: JobId,
    /// Key into the handler registry.
    pub job_type: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Handler input; always a JSON object.
    pub payload: serde_json::Value,
    /// Value returned by a successful handler.
    pub result: Option<serde_json::Value>,
    /// Claims made so far.
    pub attempts: u32,
    /// Claims allowed before the job fails permanently.
    pub max_attempts: u32,
    /// Lower values are claimed first.
    pub priority: JobPriority,
    /// Not claimable before this instant.
    pub available_at: DateTime<Utc>,
    /// Worker holding the processing lock.
    pub lock_owner: Option<String>,
    /// When the lock was taken or last renewed.
    pub locked_at: Option<DateTime<Utc>>,
    /// Last successful heartbeat.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// How long the lock survives without a heartbeat.
    pub visibility_timeout_ms: u64,
    /// Last failure, kept across retries.
    pub error: Option<JobError>,
    /// Fingerprint of type and payload; cleared once the job fails.
    pub idempotency_key: Option<String>,
    /// First claim.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on `succeeded` or `failed`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last write to the document.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `queued` document, claimable from `now`, with default limits.
    pub fn queued(job_type: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Queued,
            payload,
            result: None,
            attempts: 0,
            max_attempts: 3,
            priority: JobPriority::NORMAL,
            available_at: now,
            lock_owner: None,
            locked_at: None,
            last_heartbeat_at: None,
            visibility_timeout_ms: 60_000,
            error: None,
            idempotency_key: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job may be retried after a failure on its current attempt.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the job is claimable at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at <= now
    }

    /// Whether the processing lock has gone unrenewed past the visibility timeout.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.locked_at) {
            (JobStatus::Processing, Some(locked_at)) => {
                // An unrepresentable deadline never expires.
                i64::try_from(self.visibility_timeout_ms)
                    .ok()
                    .and_then(chrono::Duration::try_milliseconds)
                    .and_then(|timeout| locked_at.checked_add_signed(timeout))
                    .is_some_and(|deadline| deadline < now)
            }
            _ => false,
        }
    }

    /// Whether `worker_id` currently holds the processing lock.
    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.lock_owner.as_deref() == Some(worker_id)
    }
}

/// Request to submit a new job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    /// Key into the handler registry.
    pub job_type: String,
    /// Handler input; must be a JSON object.
    pub payload: serde_json::Value,
    /// Defaults to `QueueConfig::default_max_attempts`.
    pub max_attempts: Option<u32>,
    /// Defaults to [`JobPriority::NORMAL`].
    pub priority: Option<JobPriority>,
}

impl NewJob {
    /// Submission with default attempts and priority.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
            priority: None,
        }
    }

    /// Override the configured default attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the default priority tier.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Filter for listing jobs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only jobs of this type.
    pub job_type: Option<String>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Limit applied when none is given.
    pub const DEFAULT_LIMIT: usize = 100;
    /// Upper bound on any requested limit.
    pub const MAX_LIMIT: usize = 1000;

    /// Only jobs in `status`.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only jobs of `job_type`.
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Cap the number of rows returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective row limit after defaults and capping.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    /// Whether `job` satisfies the status and type predicates.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self
                .job_type
                .as_deref()
                .is_none_or(|job_type| job.job_type == job_type)
    }
}
