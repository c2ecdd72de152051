//! Job lifecycle events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::JobPriority;

/// Lifecycle event published on the [`EventBus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        job_type: String,
        priority: JobPriority,
    },
    Started {
        job_id: String,
        job_type: String,
        worker_id: usize,
    },
    Progress {
        job_id: String,
        progress: u8,
    },
    Log {
        job_id: String,
        message: String,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    RetryScheduled {
        job_id: String,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        job_id: String,
        error: String,
        retry_count: u32,
    },
    Cancelled {
        job_id: String,
    },
    DependenciesMet {
        job_id: String,
    },
    ScheduledJobTriggered {
        schedule_id: String,
        name: String,
        job_id: String,
    },
}

impl JobEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Enqueued { .. } => "job:enqueued",
            JobEvent::Started { .. } => "job:started",
            JobEvent::Progress { .. } => "job:progress",
            JobEvent::Log { .. } => "job:log",
            JobEvent::Completed { .. } => "job:completed",
            JobEvent::RetryScheduled { .. } => "job:retry_scheduled",
            JobEvent::Failed { .. } => "job:failed",
            JobEvent::Cancelled { .. } => "job:cancelled",
            JobEvent::DependenciesMet { .. } => "job:dependencies_met",
            JobEvent::ScheduledJobTriggered { .. } => "scheduled_job:triggered",
        }
    }

    /// ID of the job the event concerns.
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Log { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id }
            | JobEvent::DependenciesMet { job_id }
            | JobEvent::ScheduledJobTriggered { job_id, .. } => job_id,
        }
    }
}

/// Broadcast bus for [`JobEvent`]s.
///
/// Slow subscribers lag and drop old events rather than blocking the queue.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: JobEvent) {
        tracing::trace!(kind = event.kind(), job_id = event.job_id(), "event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(JobEvent::Cancelled {
            job_id: "job-1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "job:cancelled");
        assert_eq!(event.job_id(), "job-1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(JobEvent::DependenciesMet {
            job_id: "job-2".to_string(),
        });
    }

    #[test]
    fn test_serialized_shape() {
        let event = JobEvent::Progress {
            job_id: "job-3".to_string(),
            progress: 40,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "progress");
        assert_eq!(value["progress"], 40);
    }
}
