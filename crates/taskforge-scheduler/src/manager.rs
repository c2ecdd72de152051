//! Scheduled job management and the trigger loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskforge_config::SchedulerConfig;
use taskforge_queue::{EnqueueOptions, JobEvent, JobPriority, JobQueue, QueueError, ScheduledJob};

use crate::cron::CronExpression;
use crate::error::ScheduleError;

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;

/// Definition of a new scheduled job.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub enabled: bool,
    pub priority: JobPriority,
    pub max_retries: Option<u32>,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            job_type: job_type.into(),
            payload,
            enabled: true,
            priority: JobPriority::Normal,
            max_retries: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Partial update of a scheduled job. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub job_type: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub priority: Option<JobPriority>,
    pub max_retries: Option<Option<u32>>,
    pub enabled: Option<bool>,
}

struct Control {
    shutdown: broadcast::Sender<()>,
    exited: watch::Receiver<()>,
    handle: JoinHandle<Result<(), ScheduleError>>,
}

/// Creates, stores and triggers cron-driven jobs.
pub struct ScheduleManager {
    queue: Arc<JobQueue>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    control: Mutex<Option<Control>>,
}

impl ScheduleManager {
    pub fn new(queue: Arc<JobQueue>, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            running: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate and persist a new scheduled job. Returns its ID.
    pub async fn create(&self, new: NewSchedule) -> Result<String, ScheduleError> {
        let cron = CronExpression::parse(&new.cron)?;
        self.ensure_job_type(&new.job_type)?;
        self.ensure_unique_name(&new.name, None).await?;

        let mut schedule = ScheduledJob::new(new.name, cron.as_str(), new.job_type, new.payload);
        schedule.priority = new.priority;
        schedule.max_retries = new.max_retries;
        schedule.enabled = new.enabled;
        if schedule.enabled {
            schedule.next_run = cron.next_after(schedule.created_at);
        }

        self.queue.store().upsert_scheduled_job(&schedule).await?;
        info!(
            "Created scheduled job '{}' ({}), next run {:?}",
            schedule.name, schedule.cron_expression, schedule.next_run
        );
        Ok(schedule.id)
    }

    /// Apply `update` to a scheduled job and return the stored result.
    pub async fn update(
        &self,
        id: &str,
        update: ScheduleUpdate,
    ) -> Result<ScheduledJob, ScheduleError> {
        let mut schedule = self.require(id).await?;
        let now = Utc::now();
        let mut reschedule = false;

        if let Some(name) = update.name {
            if name != schedule.name {
                self.ensure_unique_name(&name, Some(id)).await?;
                schedule.name = name;
            }
        }
        if let Some(cron) = update.cron {
            schedule.cron_expression = CronExpression::parse(&cron)?.as_str().to_string();
            reschedule = true;
        }
        if let Some(job_type) = update.job_type {
            self.ensure_job_type(&job_type)?;
            schedule.job_type = job_type;
        }
        if let Some(payload) = update.payload {
            schedule.payload = payload;
        }
        if let Some(priority) = update.priority {
            schedule.priority = priority;
        }
        if let Some(max_retries) = update.max_retries {
            schedule.max_retries = max_retries;
        }
        if let Some(enabled) = update.enabled {
            reschedule |= enabled && !schedule.enabled;
            schedule.enabled = enabled;
        }

        if !schedule.enabled {
            schedule.next_run = None;
        } else if reschedule || schedule.next_run.is_none() {
            schedule.next_run = CronExpression::parse(&schedule.cron_expression)?.next_after(now);
        }
        schedule.updated_at = now;

        self.queue.store().upsert_scheduled_job(&schedule).await?;
        debug!("Updated scheduled job '{}'", schedule.name);
        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        if !self.queue.store().delete_scheduled_job(id).await? {
            return Err(ScheduleError::NotFound(id.to_string()));
        }
        info!("Deleted scheduled job {}", id);
        Ok(())
    }

    /// Enable a scheduled job, computing its next run from now.
    pub async fn enable(&self, id: &str) -> Result<ScheduledJob, ScheduleError> {
        self.update(
            id,
            ScheduleUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn disable(&self, id: &str) -> Result<ScheduledJob, ScheduleError> {
        self.update(
            id,
            ScheduleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, ScheduleError> {
        Ok(self.queue.store().get_scheduled_job(id).await?)
    }

    pub async fn get_all(&self) -> Result<Vec<ScheduledJob>, ScheduleError> {
        Ok(self.queue.store().list_scheduled_jobs().await?)
    }

    /// Enabled scheduled jobs whose next run has passed.
    pub async fn get_due(&self) -> Result<Vec<ScheduledJob>, ScheduleError> {
        Ok(self.queue.store().list_due_schedules(Utc::now()).await?)
    }

    /// The next `limit` enabled scheduled jobs by next run time.
    pub async fn get_upcoming(&self, limit: usize) -> Result<Vec<ScheduledJob>, ScheduleError> {
        Ok(self.queue.store().list_upcoming_schedules(limit).await?)
    }

    /// Trigger every due scheduled job. Returns how many jobs were enqueued.
    pub async fn tick(&self) -> Result<usize, ScheduleError> {
        trigger_due(&self.queue, Utc::now()).await
    }

    /// [`tick`](Self::tick) evaluated at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        trigger_due(&self.queue, now).await
    }

    /// Start the trigger loop.
    pub fn start(&self) -> Result<(), ScheduleError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning.into());
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let (alive, exited) = watch::channel(());
        let handle = tokio::spawn(run_loop(
            self.queue.clone(),
            self.config.clone(),
            self.running.clone(),
            shutdown_rx,
            alive,
        ));
        *self.control.lock() = Some(Control {
            shutdown,
            exited,
            handle,
        });

        info!("Schedule manager started (tick every {:?})", self.config.tick_interval());
        Ok(())
    }

    /// Resolve once the trigger loop has exited. Immediate when not started.
    pub async fn closed(&self) {
        let exited = self.control.lock().as_ref().map(|control| control.exited.clone());
        if let Some(mut exited) = exited {
            while exited.changed().await.is_ok() {}
        }
    }

    /// Stop the trigger loop and wait for it to exit.
    pub async fn stop(&self) -> Result<(), ScheduleError> {
        let control = self.control.lock().take();
        let Some(control) = control else {
            return Err(QueueError::NotRunning.into());
        };

        let _ = control.shutdown.send(());
        let result = control
            .handle
            .await
            .map_err(|e| QueueError::TaskFailed(e.to_string()))?;

        self.running.store(false, Ordering::SeqCst);
        info!("Schedule manager stopped");
        result
    }

    fn ensure_job_type(&self, job_type: &str) -> Result<(), ScheduleError> {
        if !self.queue.registry().contains(job_type) {
            return Err(QueueError::UnknownJobType(job_type.to_string()).into());
        }
        Ok(())
    }

    async fn ensure_unique_name(
        &self,
        name: &str,
        own_id: Option<&str>,
    ) -> Result<(), ScheduleError> {
        match self.queue.store().get_scheduled_job_by_name(name).await? {
            Some(existing) if Some(existing.id.as_str()) != own_id => {
                Err(ScheduleError::DuplicateName(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn require(&self, id: &str) -> Result<ScheduledJob, ScheduleError> {
        self.get(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }
}

/// Enqueue a job for each due schedule and advance its next run.
///
/// A schedule that was due several times while the process was down fires
/// once. Enqueue rejections are logged and the schedule still advances;
/// storage errors abort the tick.
async fn trigger_due(queue: &JobQueue, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
    let due = queue.store().list_due_schedules(now).await?;
    let mut triggered = 0;

    for mut schedule in due {
        let mut options = EnqueueOptions::new()
            .priority(schedule.priority)
            .metadata(json!({
                "scheduled_job_id": schedule.id,
                "scheduled_job_name": schedule.name,
            }));
        if let Some(max_retries) = schedule.max_retries {
            options = options.max_retries(max_retries);
        }

        let payload = schedule.payload.clone();
        let job_id = match queue.enqueue(&schedule.job_type, payload, options).await {
            Ok(job_id) => Some(job_id),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Scheduled job '{}' could not enqueue: {}", schedule.name, e);
                None
            }
        };

        schedule.next_run = match CronExpression::parse(&schedule.cron_expression) {
            Ok(cron) => cron.next_after(now),
            Err(e) => {
                warn!("Scheduled job '{}' disabled: {}", schedule.name, e);
                None
            }
        };
        if job_id.is_some() {
            schedule.last_run = Some(now);
        }
        schedule.updated_at = now;
        queue.store().upsert_scheduled_job(&schedule).await?;

        if let Some(job_id) = job_id {
            debug!("Scheduled job '{}' produced job {}", schedule.name, job_id);
            queue.events().emit(JobEvent::ScheduledJobTriggered {
                schedule_id: schedule.id,
                name: schedule.name,
                job_id,
            });
            triggered += 1;
        }
    }

    Ok(triggered)
}

async fn run_loop(
    queue: Arc<JobQueue>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
    _alive: watch::Sender<()>,
) -> Result<(), ScheduleError> {
    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = shutdown.recv() => break Ok(()),
            _ = interval.tick() => {
                match trigger_due(&queue, Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!("Triggered {} scheduled job(s)", n),
                    Err(e) if e.is_fatal() => {
                        error!("Schedule manager stopped: {}", e);
                        break Err(e);
                    }
                    Err(e) => warn!("Schedule tick failed: {}", e),
                }
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    result
}
