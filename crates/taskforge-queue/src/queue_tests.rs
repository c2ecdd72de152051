use super::*;
use crate::handler::{HandlerResult, JobContext};
use crate::job::JobPriority;
use crate::scheduled::ScheduledJob;
use crate::sqlite_store::SqliteJobStore;
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::json;

async fn noop(_payload: serde_json::Value, _ctx: JobContext) -> HandlerResult {
    Ok(serde_json::Value::Null)
}

async fn queue() -> JobQueue {
    let registry = HandlerRegistry::new();
    registry.register_fn("noop", noop);

    let config = QueueConfig {
        max_workers: 2,
        poll_interval_ms: 20,
        default_max_retries: 5,
        ..Default::default()
    };
    let store = SqliteJobStore::in_memory().await.unwrap();
    JobQueue::new(config, Arc::new(store), Arc::new(registry))
}

async fn mark(queue: &JobQueue, id: &str, status: JobStatus) {
    queue
        .store()
        .update_status(id, status, StatusFields::default().completed_at(Utc::now()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_enqueue_defaults() {
    let queue = queue().await;
    let mut events = queue.subscribe();

    let id = queue.enqueue("noop", json!({"a": 1}), EnqueueOptions::new()).await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.priority, JobPriority::Normal);
    assert_eq!(job.max_retries, 5);
    assert!(job.scheduled_at.is_none());
    assert!(job.metadata.is_object());

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind(), "job:enqueued");
    assert_eq!(event.job_id(), id);
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_type() {
    let queue = queue().await;
    let err = queue.enqueue("missing", json!({}), EnqueueOptions::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownJobType(t) if t == "missing"));
    assert!(queue.get_jobs(&JobFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_dependency_and_bad_metadata() {
    let queue = queue().await;

    let err = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().depends_on("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let err = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().metadata(json!([1, 2])))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
}

#[tokio::test]
async fn test_enqueue_with_options() {
    let queue = queue().await;
    let before = Utc::now();

    let id = queue
        .enqueue(
            "noop",
            json!({}),
            EnqueueOptions::new()
                .priority(JobPriority::High)
                .delay(Duration::from_secs(60))
                .max_retries(1)
                .metadata(json!({"owner": "billing"})),
        )
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.priority, JobPriority::High);
    assert_eq!(job.max_retries, 1);
    assert_eq!(job.metadata["owner"], "billing");
    let scheduled_at = job.scheduled_at.unwrap();
    assert!(scheduled_at >= before + chrono::Duration::seconds(59));
}

#[tokio::test]
async fn test_enqueue_status_follows_dependencies() {
    let queue = queue().await;
    let parent = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();

    let child = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().depends_on(&parent).depends_on(&parent))
        .await
        .unwrap();
    assert_eq!(queue.get_job(&child).await.unwrap().unwrap().status, JobStatus::Pending);
    assert_eq!(queue.store().list_dependencies(&child).await.unwrap(), vec![parent.clone()]);

    mark(&queue, &parent, JobStatus::Completed).await;
    let late = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().depends_on(&parent))
        .await
        .unwrap();
    assert_eq!(queue.get_job(&late).await.unwrap().unwrap().status, JobStatus::Ready);
}

#[tokio::test]
async fn test_cancel_without_dispatcher() {
    let queue = queue().await;
    let id = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();

    queue.cancel_job(&id).await.unwrap();
    assert!(queue.get_job(&id).await.unwrap().is_none());

    let err = queue.cancel_job(&id).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));
}

#[tokio::test]
async fn test_retry_job_only_from_failed() {
    let queue = queue().await;
    let id = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();

    let err = queue.retry_job(&id).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { status: JobStatus::Ready, .. }));

    queue
        .store()
        .update_status(
            &id,
            JobStatus::Failed,
            StatusFields::default().retry_count(5).error("boom").completed_at(Utc::now()),
        )
        .await
        .unwrap();

    queue.retry_job(&id).await.unwrap();
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.retry_count, 0);
    assert!(job.error.is_none());
    assert!(job.completed_at.is_none());

    let err = queue.retry_job("missing").await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));
}

#[tokio::test]
async fn test_add_dependency_rejects_cycles() {
    let queue = queue().await;
    let a = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    let b = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().depends_on(&a))
        .await
        .unwrap();
    let c = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().depends_on(&b))
        .await
        .unwrap();

    assert!(matches!(queue.add_dependency(&a, &a).await, Err(QueueError::Validation(_))));
    assert!(matches!(queue.add_dependency(&a, &c).await, Err(QueueError::Validation(_))));
    assert!(matches!(queue.add_dependency(&a, "ghost").await, Err(QueueError::JobNotFound(_))));

    // A ready job picks up an unfinished prerequisite and waits for it.
    let d = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    queue.add_dependency(&d, &c).await.unwrap();
    assert_eq!(queue.get_job(&d).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_add_dependency_requires_waiting_job() {
    let queue = queue().await;
    let a = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    let b = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    mark(&queue, &a, JobStatus::Completed).await;

    let err = queue.add_dependency(&a, &b).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { status: JobStatus::Completed, .. }));
}

/// Store that lets a dispatcher claim the job right after the edge is written.
struct ClaimOnEdgeStore {
    inner: SqliteJobStore,
}

#[async_trait]
impl JobStore for ClaimOnEdgeStore {
    async fn insert_job(&self, job: &Job, depends_on: &[String]) -> Result<(), QueueError> {
        self.inner.insert_job(job, depends_on).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.inner.list_jobs(filter).await
    }

    async fn list_ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.inner.list_ready_jobs(now, limit).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<bool, QueueError> {
        self.inner.update_status(id, status, fields).await
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), QueueError> {
        self.inner.update_progress(id, progress).await
    }

    async fn delete_job(&self, id: &str) -> Result<bool, QueueError> {
        self.inner.delete_job(id).await
    }

    async fn insert_dependency(&self, job_id: &str, depends_on: &str) -> Result<(), QueueError> {
        self.inner.insert_dependency(job_id, depends_on).await?;
        self.inner.update_status(job_id, JobStatus::Running, StatusFields::default()).await?;
        Ok(())
    }

    async fn list_dependencies(&self, job_id: &str) -> Result<Vec<String>, QueueError> {
        self.inner.list_dependencies(job_id).await
    }

    async fn list_dependency_statuses(
        &self,
        job_id: &str,
    ) -> Result<Vec<(String, Option<JobStatus>)>, QueueError> {
        self.inner.list_dependency_statuses(job_id).await
    }

    async fn list_dependents(&self, job_id: &str) -> Result<Vec<Job>, QueueError> {
        self.inner.list_dependents(job_id).await
    }

    async fn count_by_status(&self) -> Result<JobCounts, QueueError> {
        self.inner.count_by_status().await
    }

    async fn reset_running_jobs(&self) -> Result<Vec<String>, QueueError> {
        self.inner.reset_running_jobs().await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        self.inner.purge_finished(before).await
    }

    async fn upsert_scheduled_job(&self, schedule: &ScheduledJob) -> Result<(), QueueError> {
        self.inner.upsert_scheduled_job(schedule).await
    }

    async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJob>, QueueError> {
        self.inner.get_scheduled_job(id).await
    }

    async fn get_scheduled_job_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        self.inner.get_scheduled_job_by_name(name).await
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, QueueError> {
        self.inner.list_scheduled_jobs().await
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, QueueError> {
        self.inner.list_due_schedules(now).await
    }

    async fn list_upcoming_schedules(&self, limit: usize) -> Result<Vec<ScheduledJob>, QueueError> {
        self.inner.list_upcoming_schedules(limit).await
    }

    async fn delete_scheduled_job(&self, id: &str) -> Result<bool, QueueError> {
        self.inner.delete_scheduled_job(id).await
    }

    async fn count_scheduled_jobs(&self) -> Result<u64, QueueError> {
        self.inner.count_scheduled_jobs().await
    }
}

#[tokio::test]
async fn test_add_dependency_loses_race_with_dispatch() {
    let registry = HandlerRegistry::new();
    registry.register_fn("noop", noop);
    let store = ClaimOnEdgeStore {
        inner: SqliteJobStore::in_memory().await.unwrap(),
    };
    let queue = JobQueue::new(QueueConfig::default(), Arc::new(store), Arc::new(registry));

    let prerequisite = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    let job = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();

    let err = queue.add_dependency(&job, &prerequisite).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { status: JobStatus::Running, .. }));
    assert_eq!(queue.get_job(&job).await.unwrap().unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_purge_finished() {
    let queue = queue().await;
    let done = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    let open = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    mark(&queue, &done, JobStatus::Completed).await;

    assert_eq!(queue.purge_finished(Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(queue.purge_finished(Duration::ZERO).await.unwrap(), 1);
    assert!(queue.get_job(&done).await.unwrap().is_none());
    assert!(queue.get_job(&open).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats() {
    let queue = queue().await;
    queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    let failed = queue.enqueue("noop", json!({}), EnqueueOptions::new()).await.unwrap();
    mark(&queue, &failed, JobStatus::Failed).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.jobs.total, 2);
    assert_eq!(stats.jobs.ready, 1);
    assert_eq!(stats.jobs.failed, 1);
    assert_eq!(stats.workers, WorkerStats { total: 2, idle: 2, busy: 0 });
    assert_eq!(stats.scheduled_jobs, 0);
    assert!(!stats.is_running);
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let queue = queue().await;
    assert!(matches!(queue.stop().await, Err(QueueError::NotRunning)));

    queue.start().await.unwrap();
    assert!(queue.is_running());
    assert!(matches!(queue.start().await, Err(QueueError::AlreadyRunning)));
    assert!(queue.stats().await.unwrap().is_running);

    queue.stop().await.unwrap();
    assert!(!queue.is_running());

    queue.start().await.unwrap();
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_recovers_interrupted_jobs() {
    let queue = queue().await;
    let id = queue
        .enqueue("noop", json!({}), EnqueueOptions::new().delay(Duration::from_secs(3600)))
        .await
        .unwrap();
    queue.store().claim_job(&id, Utc::now()).await.unwrap();

    queue.start().await.unwrap();
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Pending);
    queue.stop().await.unwrap();
}
