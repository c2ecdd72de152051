//! Job persistence store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::{Job, JobCounts, JobFilter, JobStatus};
use crate::scheduled::ScheduledJob;

/// Column changes applied together with a status transition.
///
/// `expect` turns the write into a compare-and-set: the row is only updated
/// while its current status is one of the listed values. With `reset`, every
/// attempt-related column not explicitly set is cleared.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub expect: Vec<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub progress: Option<u8>,
    pub reset: bool,
}

impl StatusFields {
    /// Only apply while the job is in one of `statuses`.
    pub fn expecting(statuses: &[JobStatus]) -> Self {
        Self {
            expect: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Durable record of jobs, dependency edges and scheduled jobs.
///
/// The store is the single source of truth for status transitions. Every
/// method that changes a status must be atomic with respect to
/// [`list_ready_jobs`](JobStore::list_ready_jobs) so two dispatch cycles can
/// never claim the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job together with its dependency edges.
    async fn insert_job(&self, job: &Job, depends_on: &[String]) -> Result<(), QueueError>;

    /// Load a job by ID.
    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// List jobs matching a filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError>;

    /// Jobs eligible for dispatch at `now`: pending or ready, due, and with
    /// every dependency completed. Ordered by priority then creation time.
    async fn list_ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError>;

    /// Transition a job's status. Returns whether a row was updated.
    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<bool, QueueError>;

    /// Atomically move a pending/ready job to running.
    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let fields = StatusFields::expecting(&[JobStatus::Pending, JobStatus::Ready])
            .started_at(now)
            .progress(0);
        self.update_status(id, JobStatus::Running, fields).await
    }

    /// Record handler progress for a running job.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), QueueError>;

    /// Delete a job and every dependency edge touching it.
    async fn delete_job(&self, id: &str) -> Result<bool, QueueError>;

    /// Add a dependency edge.
    async fn insert_dependency(&self, job_id: &str, depends_on: &str) -> Result<(), QueueError>;

    /// IDs of the jobs `job_id` depends on.
    async fn list_dependencies(&self, job_id: &str) -> Result<Vec<String>, QueueError>;

    /// Status of each dependency of `job_id`; `None` for a missing job.
    async fn list_dependency_statuses(
        &self,
        job_id: &str,
    ) -> Result<Vec<(String, Option<JobStatus>)>, QueueError>;

    /// Jobs that directly depend on `job_id`.
    async fn list_dependents(&self, job_id: &str) -> Result<Vec<Job>, QueueError>;

    /// Count jobs by status.
    async fn count_by_status(&self) -> Result<JobCounts, QueueError>;

    /// Move every running job back to pending. Used after a crash or shutdown.
    async fn reset_running_jobs(&self) -> Result<Vec<String>, QueueError>;

    /// Delete completed and failed jobs finished before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Insert or replace a scheduled job.
    async fn upsert_scheduled_job(&self, schedule: &ScheduledJob) -> Result<(), QueueError>;

    async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJob>, QueueError>;

    async fn get_scheduled_job_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJob>, QueueError>;

    /// All scheduled jobs ordered by name.
    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, QueueError>;

    /// Enabled scheduled jobs whose `next_run` is at or before `now`.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, QueueError>;

    /// Enabled scheduled jobs ordered by `next_run`.
    async fn list_upcoming_schedules(&self, limit: usize) -> Result<Vec<ScheduledJob>, QueueError>;

    async fn delete_scheduled_job(&self, id: &str) -> Result<bool, QueueError>;

    async fn count_scheduled_jobs(&self) -> Result<u64, QueueError>;
}
