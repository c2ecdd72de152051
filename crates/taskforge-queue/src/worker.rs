//! Worker pool for job execution.
//!
//! Each busy slot owns one execution unit: a spawned task running a single
//! handler invocation. Units never touch the store; they report back over an
//! mpsc channel that the dispatcher drains.
//!
//! Aborting a unit only takes effect at its next `.await`. A terminated slot
//! therefore stays occupied until the unit actually reports back, so a handler
//! that blocks its thread keeps holding its worker. Blocking work belongs in
//! `tokio::task::spawn_blocking`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::handler::{HandlerRegistry, HandlerResult, JobContext};
use crate::job::Job;

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
    /// The unit was aborted before it produced a result.
    Aborted,
}

impl From<HandlerResult> for JobOutcome {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(value) => JobOutcome::Completed(value),
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }
}

/// Message from an execution unit to the dispatcher.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Progress { job_id: String, progress: u8 },
    Log { job_id: String, message: String },
    Finished {
        slot: usize,
        job_id: String,
        outcome: JobOutcome,
    },
}

/// Lifecycle of an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Running,
    /// Abort requested; the outcome, whatever it is, gets discarded.
    Terminating,
}

#[derive(Debug)]
struct RunningJob {
    job_id: String,
    abort: AbortHandle,
    started_at: Instant,
    state: SlotState,
}

impl RunningJob {
    fn terminate(&mut self) {
        self.state = SlotState::Terminating;
        self.abort.abort();
    }
}

/// Fixed-size set of execution slots.
pub struct WorkerPool {
    slots: Vec<Option<RunningJob>>,
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool with `size` slots reporting on `tx`.
    pub fn new(
        size: usize,
        registry: Arc<HandlerRegistry>,
        timeout: Option<Duration>,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| None).collect(),
            registry,
            timeout,
            tx,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.size() - self.busy_count()
    }

    /// Shared busy-slot counter readable from outside the dispatcher.
    pub fn gauge(&self) -> Arc<AtomicUsize> {
        self.busy.clone()
    }

    /// IDs of jobs currently executing. Terminating slots are excluded.
    pub fn running_jobs(&self) -> Vec<String> {
        self.slots
            .iter()
            .flatten()
            .filter(|running| running.state == SlotState::Running)
            .map(|running| running.job_id.clone())
            .collect()
    }

    /// Start `job` on an idle slot. Returns the slot, or `None` when full.
    pub fn execute(&mut self, job: &Job) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;

        let handler = self.registry.get(&job.job_type);
        let ctx = JobContext::new(&job.id, &job.job_type, job.retry_count, self.tx.clone());
        let job_type = job.job_type.clone();
        let payload = job.payload.clone();
        let timeout = self.timeout;

        let unit = tokio::spawn(async move {
            let Some(handler) = handler else {
                return JobOutcome::Failed(QueueError::UnknownJobType(job_type).to_string());
            };
            let run = handler.run(payload, ctx);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result.into(),
                    Err(_) => JobOutcome::Failed(format!("job timed out after {:?}", limit)),
                },
                None => run.await.into(),
            }
        });

        let abort = unit.abort_handle();
        let tx = self.tx.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let outcome = match unit.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => JobOutcome::Aborted,
                Err(e) => {
                    let message = panic_message(e.into_panic());
                    warn!("Execution unit for job {} panicked: {}", job_id, message);
                    JobOutcome::Failed(format!("worker crashed: {}", message))
                }
            };
            let _ = tx.send(WorkerMessage::Finished { slot, job_id, outcome });
        });

        self.slots[slot] = Some(RunningJob {
            job_id: job.id.clone(),
            abort,
            started_at: Instant::now(),
            state: SlotState::Running,
        });
        self.busy.fetch_add(1, Ordering::SeqCst);
        debug!("Job {} assigned to worker {}", job.id, slot);
        Some(slot)
    }

    /// Free `slot` if it still holds `job_id`.
    ///
    /// Returns the state the slot was in, or `None` for a stale report.
    pub fn release(&mut self, slot: usize, job_id: &str) -> Option<SlotState> {
        let entry = self.slots.get_mut(slot)?;
        if !entry.as_ref().is_some_and(|r| r.job_id == job_id) {
            return None;
        }
        let running = entry.take()?;
        self.busy.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "Worker {} released job {} after {:?}",
            slot,
            job_id,
            running.started_at.elapsed()
        );
        Some(running.state)
    }

    /// Abort the unit running `job_id`.
    ///
    /// The slot is only freed once the unit reports back.
    pub fn terminate(&mut self, job_id: &str) -> bool {
        match self
            .slots
            .iter_mut()
            .flatten()
            .find(|r| r.job_id == job_id && r.state == SlotState::Running)
        {
            Some(running) => {
                running.terminate();
                true
            }
            None => false,
        }
    }

    /// Abort units that have been running for `limit` or longer.
    ///
    /// Returns the IDs of the expired jobs.
    pub fn expire(&mut self, limit: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        for running in self.slots.iter_mut().flatten() {
            if running.state == SlotState::Running && running.started_at.elapsed() >= limit {
                running.terminate();
                expired.push(running.job_id.clone());
            }
        }
        expired
    }

    /// Abort every running unit. Returns the affected job IDs.
    pub fn terminate_all(&mut self) -> Vec<String> {
        let mut aborted = Vec::new();
        for entry in &mut self.slots {
            if let Some(running) = entry.take() {
                running.abort.abort();
                aborted.push(running.job_id);
            }
        }
        self.busy.fetch_sub(aborted.len(), Ordering::SeqCst);
        aborted
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
