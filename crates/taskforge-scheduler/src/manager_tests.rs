use super::*;
use chrono::{Duration, Timelike};
use taskforge_config::QueueConfig;
use taskforge_queue::{
    HandlerRegistry, HandlerResult, JobContext, JobFilter, JobStore, SqliteJobStore,
};

async fn noop(_payload: serde_json::Value, _ctx: JobContext) -> HandlerResult {
    Ok(serde_json::Value::Null)
}

async fn manager() -> ScheduleManager {
    let registry = HandlerRegistry::new();
    registry.register_fn("report", noop);
    registry.register_fn("backup", noop);

    let store = SqliteJobStore::in_memory().await.unwrap();
    let queue = JobQueue::new(QueueConfig::default(), Arc::new(store), Arc::new(registry));
    ScheduleManager::new(Arc::new(queue), SchedulerConfig::default())
}

fn store(manager: &ScheduleManager) -> &Arc<dyn JobStore> {
    manager.queue.store()
}

#[tokio::test]
async fn test_create_computes_next_run() {
    let manager = manager().await;
    let before = Utc::now();

    let id = manager
        .create(NewSchedule::new("every-five", "*/5 * * * *", "report", json!({"kind": "daily"})))
        .await
        .unwrap();

    let schedule = manager.get(&id).await.unwrap().unwrap();
    let next_run = schedule.next_run.unwrap();
    assert!(next_run > before);
    assert!(next_run <= before + Duration::minutes(5));
    assert_eq!(next_run.minute() % 5, 0);
    assert_eq!(next_run.second(), 0);
    assert!(schedule.enabled);
    assert!(schedule.last_run.is_none());
}

#[tokio::test]
async fn test_create_validation() {
    let manager = manager().await;

    let err = manager
        .create(NewSchedule::new("bad", "61 * * * *", "report", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::CronParse { .. }));

    let err = manager
        .create(NewSchedule::new("unknown", "@daily", "missing", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Queue(QueueError::UnknownJobType(_))));

    manager
        .create(NewSchedule::new("nightly", "@daily", "backup", json!({})))
        .await
        .unwrap();
    let err = manager
        .create(NewSchedule::new("nightly", "@hourly", "backup", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::DuplicateName(name) if name == "nightly"));

    assert_eq!(manager.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_schedule_has_no_next_run() {
    let manager = manager().await;
    let id = manager
        .create(NewSchedule::new("paused", "@hourly", "report", json!({})).enabled(false))
        .await
        .unwrap();

    let schedule = manager.get(&id).await.unwrap().unwrap();
    assert!(!schedule.enabled);
    assert!(schedule.next_run.is_none());
    assert!(manager.get_upcoming(10).await.unwrap().is_empty());

    let enabled = manager.enable(&id).await.unwrap();
    assert!(enabled.enabled);
    assert!(enabled.next_run.is_some());
    assert_eq!(manager.get_upcoming(10).await.unwrap().len(), 1);

    let disabled = manager.disable(&id).await.unwrap();
    assert!(disabled.next_run.is_none());
}

#[tokio::test]
async fn test_update_fields() {
    let manager = manager().await;
    let id = manager
        .create(NewSchedule::new("a", "@daily", "report", json!({})))
        .await
        .unwrap();
    manager
        .create(NewSchedule::new("b", "@daily", "report", json!({})))
        .await
        .unwrap();

    let err = manager
        .update(
            &id,
            ScheduleUpdate {
                name: Some("b".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::DuplicateName(_)));

    let updated = manager
        .update(
            &id,
            ScheduleUpdate {
                cron: Some("@hourly".to_string()),
                job_type: Some("backup".to_string()),
                priority: Some(JobPriority::High),
                max_retries: Some(Some(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.cron_expression, "@hourly");
    assert_eq!(updated.job_type, "backup");
    assert_eq!(updated.priority, JobPriority::High);
    assert_eq!(updated.max_retries, Some(1));
    assert!(updated.next_run.unwrap() <= Utc::now() + Duration::hours(1));

    let err = manager.update("missing", ScheduleUpdate::default()).await.unwrap_err();
    assert!(matches!(err, ScheduleError::NotFound(_)));
}

#[tokio::test]
async fn test_delete() {
    let manager = manager().await;
    let id = manager
        .create(NewSchedule::new("gone", "@daily", "report", json!({})))
        .await
        .unwrap();

    manager.delete(&id).await.unwrap();
    assert!(manager.get(&id).await.unwrap().is_none());
    assert!(matches!(manager.delete(&id).await, Err(ScheduleError::NotFound(_))));
}

#[tokio::test]
async fn test_tick_enqueues_due_schedule() {
    let manager = manager().await;
    let mut events = manager.queue.subscribe();
    let id = manager
        .create(
            NewSchedule::new("minutely", "* * * * *", "report", json!({"n": 1}))
                .priority(JobPriority::Critical)
                .max_retries(7),
        )
        .await
        .unwrap();
    let next_run = manager.get(&id).await.unwrap().unwrap().next_run.unwrap();

    // Not due yet.
    assert_eq!(manager.tick_at(next_run - Duration::seconds(1)).await.unwrap(), 0);

    assert_eq!(manager.tick_at(next_run).await.unwrap(), 1);

    let jobs = manager.queue.get_jobs(&JobFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.job_type, "report");
    assert_eq!(job.payload, json!({"n": 1}));
    assert_eq!(job.priority, JobPriority::Critical);
    assert_eq!(job.max_retries, 7);
    assert_eq!(job.metadata["scheduled_job_id"], id.as_str());
    assert_eq!(job.metadata["scheduled_job_name"], "minutely");

    let schedule = manager.get(&id).await.unwrap().unwrap();
    assert_eq!(schedule.last_run, Some(next_run));
    assert_eq!(schedule.next_run, Some(next_run + Duration::minutes(1)));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds, vec!["job:enqueued", "scheduled_job:triggered"]);
}

#[tokio::test]
async fn test_missed_runs_fire_once() {
    let manager = manager().await;
    let id = manager
        .create(NewSchedule::new("hourly", "0 * * * *", "report", json!({})))
        .await
        .unwrap();
    let next_run = manager.get(&id).await.unwrap().unwrap().next_run.unwrap();

    let much_later = next_run + Duration::hours(5) + Duration::minutes(30);
    assert_eq!(manager.tick_at(much_later).await.unwrap(), 1);
    assert_eq!(manager.tick_at(much_later).await.unwrap(), 0);

    let schedule = manager.get(&id).await.unwrap().unwrap();
    assert_eq!(schedule.next_run, Some(next_run + Duration::hours(6)));
}

#[tokio::test]
async fn test_rejected_enqueue_still_advances() {
    let manager = manager().await;
    let mut schedule = ScheduledJob::new("orphan", "* * * * *", "unregistered", json!({}));
    let due = Utc::now() - Duration::minutes(1);
    schedule.next_run = Some(due);
    store(&manager).upsert_scheduled_job(&schedule).await.unwrap();

    assert_eq!(manager.tick().await.unwrap(), 0);

    let stored = manager.get(&schedule.id).await.unwrap().unwrap();
    assert!(stored.next_run.unwrap() > due);
    assert!(stored.last_run.is_none());
    assert!(manager.get_due().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_stop() {
    let manager = manager().await;
    assert!(manager.stop().await.is_err());

    manager.start().unwrap();
    assert!(manager.is_running());
    assert!(manager.start().is_err());

    manager.stop().await.unwrap();
    assert!(!manager.is_running());
}
