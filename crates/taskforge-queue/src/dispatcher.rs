//! Dispatch loop.
//!
//! The dispatcher is the only owner of the [`WorkerPool`]. It polls the store
//! for eligible jobs, drains execution-unit reports and applies management
//! commands, all from one `select!` loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::events::{EventBus, JobEvent};
use crate::handler::HandlerRegistry;
use crate::job::{Job, JobStatus, chrono_duration};
use crate::store::{JobStore, StatusFields};
use crate::worker::{JobOutcome, SlotState, WorkerMessage, WorkerPool};
use taskforge_config::QueueConfig;

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent)
}

/// Management request handled inside the dispatch loop.
#[derive(Debug)]
pub(crate) enum Command {
    Cancel {
        job_id: String,
        reply: oneshot::Sender<Result<bool, QueueError>>,
    },
}

/// Assigns eligible jobs to idle workers and records their outcomes.
pub struct Dispatcher {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    events: EventBus,
    pool: WorkerPool,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    commands: mpsc::Receiver<Command>,
    running: Arc<AtomicBool>,
    // Dropped together with the dispatcher; receivers observe the exit.
    alive: watch::Sender<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        events: EventBus,
        commands: mpsc::Receiver<Command>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let (tx, messages) = mpsc::unbounded_channel();
        let timeout = config.job_timeout();
        let pool = WorkerPool::new(config.max_workers as usize, registry, timeout, tx);
        let (alive, _) = watch::channel(());
        Self {
            config,
            store,
            events,
            pool,
            messages,
            commands,
            running,
            alive,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Receiver whose `changed()` errors once the dispatcher is gone.
    pub(crate) fn exit_signal(&self) -> watch::Receiver<()> {
        self.alive.subscribe()
    }

    /// Run until shutdown is signalled or the store fails.
    ///
    /// On exit every in-flight execution unit is aborted and its job is put
    /// back to pending.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), QueueError> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Dispatcher started with {} workers (poll every {:?})",
            self.pool.size(),
            self.config.poll_interval()
        );

        let result = loop {
            let step = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Dispatcher shutting down");
                    break Ok(());
                }
                _ = interval.tick() => self.tick().await,
                Some(message) = self.messages.recv() => self.handle_message(message).await,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
            };

            if let Err(e) = step {
                if e.is_fatal() {
                    error!("Dispatcher stopped: {}", e);
                    break Err(e);
                }
                warn!("Dispatch error: {}", e);
            }
        };

        self.drain().await;
        result
    }

    /// Fail overdue jobs, then fill idle slots with eligible jobs.
    async fn tick(&mut self) -> Result<(), QueueError> {
        if let Some(limit) = self.config.job_timeout() {
            for job_id in self.pool.expire(limit) {
                warn!("Job {} exceeded its {:?} timeout", job_id, limit);
                self.fail(job_id, format!("job timed out after {:?}", limit)).await?;
            }
        }

        let idle = self.pool.idle_count();
        if idle == 0 {
            return Ok(());
        }

        let now = Utc::now();
        let jobs = self.store.list_ready_jobs(now, idle).await?;

        for job in jobs {
            if !self.store.claim_job(&job.id, now).await? {
                debug!("Job {} was claimed or removed before dispatch", job.id);
                continue;
            }

            let Some(slot) = self.pool.execute(&job) else {
                // Pool filled up between the count and the claim; hand the job back.
                let fields = StatusFields::expecting(&[JobStatus::Running]);
                self.store.update_status(&job.id, JobStatus::Pending, fields).await?;
                break;
            };

            debug!("Dispatched job {} ({}) to worker {}", job.id, job.job_type, slot);
            self.events.emit(JobEvent::Started {
                job_id: job.id.clone(),
                job_type: job.job_type.clone(),
                worker_id: slot,
            });
        }

        Ok(())
    }

    async fn handle_message(&mut self, message: WorkerMessage) -> Result<(), QueueError> {
        match message {
            WorkerMessage::Progress { job_id, progress } => {
                self.store.update_progress(&job_id, progress).await?;
                self.events.emit(JobEvent::Progress { job_id, progress });
            }
            WorkerMessage::Log { job_id, message } => {
                info!(job_id = %job_id, "{}", message);
                self.events.emit(JobEvent::Log { job_id, message });
            }
            WorkerMessage::Finished { slot, job_id, outcome } => {
                match self.pool.release(slot, &job_id) {
                    Some(SlotState::Running) => {}
                    Some(SlotState::Terminating) => {
                        debug!("Worker {} freed by terminated job {}", slot, job_id);
                        return Ok(());
                    }
                    None => {
                        debug!("Ignoring stale outcome for job {}", job_id);
                        return Ok(());
                    }
                }
                match outcome {
                    JobOutcome::Completed(result) => self.complete(job_id, result).await?,
                    JobOutcome::Failed(message) => self.fail(job_id, message).await?,
                    JobOutcome::Aborted => debug!("Job {} aborted", job_id),
                }
            }
        }
        Ok(())
    }

    /// Apply a management command. A storage failure is reported to the
    /// caller and also returned so the loop stops.
    async fn handle_command(&mut self, command: Command) -> Result<(), QueueError> {
        match command {
            Command::Cancel { job_id, reply } => {
                if self.pool.terminate(&job_id) {
                    info!("Aborting execution of job {}", job_id);
                }
                match cancel_in_store(self.store.as_ref(), &self.events, &job_id).await {
                    Err(QueueError::Storage(message)) => {
                        let _ = reply.send(Err(QueueError::Storage(message.clone())));
                        Err(QueueError::Storage(message))
                    }
                    result => {
                        let _ = reply.send(result);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn complete(
        &mut self,
        job_id: String,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let fields = StatusFields::expecting(&[JobStatus::Running])
            .completed_at(Utc::now())
            .result(result.clone())
            .progress(100);
        if !self.store.update_status(&job_id, JobStatus::Completed, fields).await? {
            debug!("Job {} left running state before completion was recorded", job_id);
            return Ok(());
        }

        info!("Job {} completed", job_id);
        self.events.emit(JobEvent::Completed {
            job_id: job_id.clone(),
            result,
        });

        let dependents = self.store.list_dependents(&job_id).await?;
        release_dependents(self.store.as_ref(), &self.events, dependents).await
    }

    async fn fail(&mut self, job_id: String, message: String) -> Result<(), QueueError> {
        let Some(job) = self.store.get_job(&job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let now = Utc::now();
        let next = job.retry_count + 1;

        if next <= job.max_retries {
            let delay = retry_delay(self.config.retry_delay_base(), next);
            let scheduled_at = now + chrono_duration(delay);

            let fields = StatusFields::expecting(&[JobStatus::Running])
                .retry_count(next)
                .scheduled_at(scheduled_at)
                .error(message.clone());
            if self.store.update_status(&job_id, JobStatus::Pending, fields).await? {
                warn!(
                    "Job {} failed (attempt {}/{}), retrying in {:?}: {}",
                    job_id,
                    next,
                    job.max_retries + 1,
                    delay,
                    message
                );
                self.events.emit(JobEvent::RetryScheduled {
                    job_id,
                    retry_count: next,
                    scheduled_at,
                    error: message,
                });
            }
        } else {
            let fields = StatusFields::expecting(&[JobStatus::Running])
                .completed_at(now)
                .error(message.clone());
            if self.store.update_status(&job_id, JobStatus::Failed, fields).await? {
                warn!("Job {} failed permanently: {}", job_id, message);
                self.events.emit(JobEvent::Failed {
                    job_id,
                    error: message,
                    retry_count: job.retry_count,
                });
            }
        }

        Ok(())
    }

    async fn drain(&mut self) {
        let aborted = self.pool.terminate_all();
        if !aborted.is_empty() {
            info!("Aborted {} in-flight job(s)", aborted.len());
        }

        match self.store.reset_running_jobs().await {
            Ok(reset) if !reset.is_empty() => {
                info!("Returned {} running job(s) to pending", reset.len());
            }
            Ok(_) => {}
            Err(e) => error!("Failed to reset running jobs: {}", e),
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

/// Move pending dependents whose prerequisites are all completed to ready.
pub(crate) async fn release_dependents(
    store: &dyn JobStore,
    events: &EventBus,
    dependents: Vec<Job>,
) -> Result<(), QueueError> {
    for dependent in dependents {
        if dependent.status != JobStatus::Pending {
            continue;
        }

        let statuses = store.list_dependency_statuses(&dependent.id).await?;
        if !statuses.iter().all(|(_, status)| *status == Some(JobStatus::Completed)) {
            continue;
        }

        let fields = StatusFields::expecting(&[JobStatus::Pending]);
        if store.update_status(&dependent.id, JobStatus::Ready, fields).await? {
            debug!("Dependencies of job {} satisfied", dependent.id);
            events.emit(JobEvent::DependenciesMet { job_id: dependent.id });
        }
    }
    Ok(())
}

/// Delete a job record and re-evaluate the jobs that waited on it.
pub(crate) async fn cancel_in_store(
    store: &dyn JobStore,
    events: &EventBus,
    job_id: &str,
) -> Result<bool, QueueError> {
    let dependents = store.list_dependents(job_id).await?;
    if !store.delete_job(job_id).await? {
        return Ok(false);
    }

    info!("Job {} cancelled", job_id);
    events.emit(JobEvent::Cancelled {
        job_id: job_id.to_string(),
    });

    release_dependents(store, events, dependents).await?;
    Ok(true)
}
