//! Scheduler errors.

use taskforge_queue::QueueError;
use thiserror::Error;

/// Scheduler error types.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Malformed cron expression.
    #[error("Invalid cron expression '{expression}': {reason}")]
    CronParse { expression: String, reason: String },

    /// Scheduled job not found.
    #[error("Scheduled job not found: {0}")]
    NotFound(String),

    /// Another scheduled job already uses this name.
    #[error("Scheduled job name already in use: {0}")]
    DuplicateName(String),

    /// Error from the underlying queue or store.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ScheduleError {
    pub(crate) fn cron(expression: &str, reason: impl Into<String>) -> Self {
        ScheduleError::CronParse {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the scheduler loop must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScheduleError::Queue(e) if e.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ScheduleError::cron("* *", "expected 5 fields, found 2");
        assert_eq!(
            err.to_string(),
            "Invalid cron expression '* *': expected 5 fields, found 2"
        );
    }

    #[test]
    fn test_fatal_only_for_storage() {
        assert!(ScheduleError::from(QueueError::Storage("locked".to_string())).is_fatal());
        assert!(!ScheduleError::from(QueueError::UnknownJobType("x".to_string())).is_fatal());
        assert!(!ScheduleError::NotFound("id".to_string()).is_fatal());
    }
}
