use thiserror::Error;

use crate::dead_letter::DeadLetterId;
use crate::job::JobId;

/// Errors surfaced by the queue engine's public operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A job with the same type and payload already holds the idempotency key.
    #[error("duplicate job of type '{job_type}' (idempotency key {idempotency_key})")]
    Conflict {
        /// Type of the rejected job.
        job_type: String,
        /// Key already held by a live job.
        idempotency_key: String,
    },

    /// No job document with this id.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// No dead-letter record with this id.
    #[error("dead-letter record {0} not found")]
    DeadLetterNotFound(DeadLetterId),

    /// Job type was empty or malformed.
    #[error("invalid job type: {0}")]
    InvalidJobType(String),

    /// Payload could not be accepted.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration failed to load or validate.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure not tied to a specific driver.
    #[error("store error: {0}")]
    Store(String),

    /// PostgreSQL driver failure.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Whether the failure came from the storage layer rather than the caller.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            QueueError::Store(_) => true,
            #[cfg(feature = "postgres")]
            QueueError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<::config::ConfigError> for QueueError {
    fn from(err: ::config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

/// Result alias used across the crate.
pub type QueueResult<T> = Result<T, QueueError>;
