//! Queue errors.

use thiserror::Error;

use crate::job::JobStatus;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// No handler registered for the job type.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Rejected input (bad options, dependency, cycle).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the job's current status.
    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: JobStatus,
        expected: String,
    },

    /// Persistence layer failure. Fatal to the dispatcher.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Queue is already running.
    #[error("Queue is already running")]
    AlreadyRunning,

    /// Queue is not running.
    #[error("Queue is not running")]
    NotRunning,

    /// A background task ended abnormally.
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the error means the store can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Storage(_))
    }
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}
