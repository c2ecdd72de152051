//! Job queue facade.
//!
//! [`JobQueue`] owns the store, the handler registry and the event bus, and
//! starts/stops the [`Dispatcher`]. The management API works whether or not
//! the dispatcher is running.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{Command, Dispatcher, cancel_in_store};
use crate::error::QueueError;
use crate::events::{EventBus, JobEvent};
use crate::handler::HandlerRegistry;
use crate::job::{EnqueueOptions, Job, JobCounts, JobFilter, JobStatus, chrono_duration};
use crate::store::{JobStore, StatusFields};
use taskforge_config::QueueConfig;

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

/// Worker slot utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub jobs: JobCounts,
    pub workers: WorkerStats,
    pub scheduled_jobs: u64,
    pub is_running: bool,
}

struct Control {
    shutdown: broadcast::Sender<()>,
    commands: mpsc::Sender<Command>,
    busy: Arc<AtomicUsize>,
    exited: watch::Receiver<()>,
    handle: JoinHandle<Result<(), QueueError>>,
}

/// Persistent priority job queue.
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    running: Arc<AtomicBool>,
    control: Mutex<Option<Control>>,
}

impl JobQueue {
    /// Create a queue over `store`. Call [`start`](Self::start) to begin dispatching.
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            store,
            registry,
            events,
            running: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolve once the dispatcher task has exited, for whatever reason.
    ///
    /// Returns immediately when the queue was never started or is stopped.
    /// Call [`stop`](Self::stop) afterwards to collect the exit error.
    pub async fn closed(&self) {
        let exited = self.control.lock().as_ref().map(|control| control.exited.clone());
        if let Some(mut exited) = exited {
            while exited.changed().await.is_ok() {}
        }
    }

    /// Add a job. Returns its ID.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        if !self.registry.contains(job_type) {
            return Err(QueueError::UnknownJobType(job_type.to_string()));
        }

        let metadata = match options.metadata {
            Some(metadata) if !metadata.is_object() => {
                let message = "metadata must be a JSON object".to_string();
                return Err(QueueError::Validation(message));
            }
            Some(metadata) => metadata,
            None => serde_json::Value::Object(Default::default()),
        };

        let mut seen = HashSet::new();
        let dependencies: Vec<String> = options
            .dependencies
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut blocked = false;
        for dependency in &dependencies {
            match self.store.get_job(dependency).await? {
                Some(job) => blocked |= job.status != JobStatus::Completed,
                None => {
                    let message = format!("unknown dependency '{}'", dependency);
                    return Err(QueueError::Validation(message));
                }
            }
        }

        let now = Utc::now();
        let status = if blocked { JobStatus::Pending } else { JobStatus::Ready };
        let mut job = Job::new(job_type, payload)
            .with_priority(options.priority)
            .with_max_retries(options.max_retries.unwrap_or(self.config.default_max_retries))
            .with_metadata(metadata)
            .with_status(status);
        job.scheduled_at = options
            .scheduled_at
            .or_else(|| options.delay.map(|delay| now + chrono_duration(delay)));

        self.store.insert_job(&job, &dependencies).await?;

        debug!(
            "Enqueued job {} ({}, {}, {} dependencies)",
            job.id,
            job.job_type,
            job.priority,
            dependencies.len()
        );
        self.events.emit(JobEvent::Enqueued {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority,
        });

        Ok(job.id)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.store.get_job(id).await
    }

    /// List jobs, newest first.
    pub async fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.store.list_jobs(filter).await
    }

    /// Delete a job, aborting its execution if it is running.
    pub async fn cancel_job(&self, id: &str) -> Result<(), QueueError> {
        let commands = self.control.lock().as_ref().map(|control| control.commands.clone());

        let cancelled = match commands {
            Some(commands) if self.is_running() => {
                let (reply, rx) = oneshot::channel();
                commands
                    .send(Command::Cancel {
                        job_id: id.to_string(),
                        reply,
                    })
                    .await
                    .map_err(|_| QueueError::NotRunning)?;
                rx.await.map_err(|_| QueueError::NotRunning)??
            }
            _ => cancel_in_store(self.store.as_ref(), &self.events, id).await?,
        };

        if !cancelled {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Re-run a failed job from scratch.
    pub async fn retry_job(&self, id: &str) -> Result<(), QueueError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: job.status,
                expected: JobStatus::Failed.to_string(),
            });
        }

        let fields = StatusFields::expecting(&[JobStatus::Failed])
            .retry_count(0)
            .progress(0)
            .reset();
        if !self.store.update_status(id, JobStatus::Ready, fields).await? {
            return Err(QueueError::JobNotFound(id.to_string()));
        }

        info!("Job {} queued for retry", id);
        self.events.emit(JobEvent::Enqueued {
            job_id: job.id,
            job_type: job.job_type,
            priority: job.priority,
        });
        Ok(())
    }

    /// Make `job_id` wait for `depends_on`. Rejects self-edges and cycles.
    pub async fn add_dependency(&self, job_id: &str, depends_on: &str) -> Result<(), QueueError> {
        if job_id == depends_on {
            return Err(QueueError::Validation(format!("job {} cannot depend on itself", job_id)));
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let prerequisite = self
            .store
            .get_job(depends_on)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(depends_on.to_string()))?;

        if !job.status.is_waiting() {
            return Err(QueueError::InvalidState {
                id: job_id.to_string(),
                status: job.status,
                expected: "pending or ready".to_string(),
            });
        }

        if self.depends_transitively(depends_on, job_id).await? {
            return Err(QueueError::Validation(format!(
                "dependency {} -> {} would create a cycle",
                job_id, depends_on
            )));
        }

        self.store.insert_dependency(job_id, depends_on).await?;

        // With the edge in place the job can no longer be claimed; this
        // compare-and-set catches a claim made since the read above.
        if prerequisite.status != JobStatus::Completed {
            let waiting = [JobStatus::Pending, JobStatus::Ready];
            let fields = StatusFields::expecting(&waiting);
            if !self.store.update_status(job_id, JobStatus::Pending, fields).await? {
                let current = self
                    .store
                    .get_job(job_id)
                    .await?
                    .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
                return Err(QueueError::InvalidState {
                    id: job_id.to_string(),
                    status: current.status,
                    expected: "pending or ready".to_string(),
                });
            }
        }

        debug!("Job {} now depends on {}", job_id, depends_on);
        Ok(())
    }

    /// Whether `from` reaches `target` by following dependency edges.
    async fn depends_transitively(&self, from: &str, target: &str) -> Result<bool, QueueError> {
        let mut stack = vec![from.to_string()];
        let mut visited = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.extend(self.store.list_dependencies(&current).await?);
        }

        Ok(false)
    }

    /// Delete completed and failed jobs that finished more than `older_than` ago.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64, QueueError> {
        let before = Utc::now() - chrono_duration(older_than);
        let purged = self.store.purge_finished(before).await?;
        if purged > 0 {
            info!("Purged {} finished job(s)", purged);
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.store.count_by_status().await?;
        let scheduled_jobs = self.store.count_scheduled_jobs().await?;

        let total = self.config.max_workers.max(1) as usize;
        let busy = if self.is_running() {
            self.control
                .lock()
                .as_ref()
                .map_or(0, |control| control.busy.load(Ordering::SeqCst))
        } else {
            0
        };

        Ok(QueueStats {
            jobs,
            workers: WorkerStats {
                total,
                idle: total.saturating_sub(busy),
                busy,
            },
            scheduled_jobs,
            is_running: self.is_running(),
        })
    }

    /// Start the dispatcher.
    ///
    /// Jobs left running by a previous process are returned to pending first.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }

        let recovered = match self.store.reset_running_jobs().await {
            Ok(recovered) => recovered,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !recovered.is_empty() {
            warn!("Recovered {} job(s) interrupted by a previous shutdown", recovered.len());
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let (commands, commands_rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(
            self.config.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.events.clone(),
            commands_rx,
            self.running.clone(),
        );
        let busy = dispatcher.pool().gauge();
        let exited = dispatcher.exit_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        *self.control.lock() = Some(Control {
            shutdown,
            commands,
            busy,
            exited,
            handle,
        });

        info!("Job queue started");
        Ok(())
    }

    /// Stop the dispatcher and wait for it to exit.
    ///
    /// Returns the error that terminated the dispatcher, if any.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let control = self.control.lock().take();
        let Some(control) = control else {
            return Err(QueueError::NotRunning);
        };

        let _ = control.shutdown.send(());
        let result = control
            .handle
            .await
            .map_err(|e| QueueError::TaskFailed(e.to_string()))?;

        self.running.store(false, Ordering::SeqCst);
        info!("Job queue stopped");
        result
    }
}
