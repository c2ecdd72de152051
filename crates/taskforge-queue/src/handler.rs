//! Job handlers and the handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::worker::WorkerMessage;

/// Failure reported by a handler. Retried according to the job's budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError(format!("invalid payload: {}", err))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError(err.to_string())
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Handle given to a running job for reporting back to the queue.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    job_type: String,
    attempt: u32,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: impl Into<String>,
        job_type: impl Into<String>,
        attempt: u32,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            attempt,
            tx,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Zero for the first execution, incremented by each retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report completion percentage. Values above 100 are clamped.
    pub fn update_progress(&self, percent: u8) {
        let _ = self.tx.send(WorkerMessage::Progress {
            job_id: self.job_id.clone(),
            progress: percent.min(100),
        });
    }

    /// Emit a log line attached to this job.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(WorkerMessage::Log {
            job_id: self.job_id.clone(),
            message: message.into(),
        });
    }
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: serde_json::Value, ctx: JobContext) -> HandlerResult;
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value, ctx: JobContext) -> HandlerResult {
        (self.func)(payload, ctx).await
    }
}

/// Maps job types to handlers. Populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        debug!("Registered handler for job type '{}'", job_type);
        self.handlers.write().insert(job_type, handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, func: F)
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler { func }));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, payload: serde_json::Value, _ctx: JobContext) -> HandlerResult {
            Ok(payload)
        }
    }

    fn context() -> (JobContext, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobContext::new("job-1", "echo", 0, tx), rx)
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        registry.register_fn("fail", |_payload, _ctx| async {
            Err::<serde_json::Value, HandlerError>("nope".into())
        });

        assert!(registry.contains("echo"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.types(), vec!["echo".to_string(), "fail".to_string()]);

        let (ctx, _rx) = context();
        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.run(json!({"a": 1}), ctx.clone()).await.unwrap(), json!({"a": 1}));

        let fail = registry.get("fail").unwrap();
        assert_eq!(fail.run(json!(null), ctx).await.unwrap_err(), HandlerError("nope".to_string()));
    }

    #[tokio::test]
    async fn test_context_reports_progress_and_logs() {
        let (ctx, mut rx) = context();
        ctx.update_progress(150);
        ctx.log("halfway");

        match rx.recv().await.unwrap() {
            WorkerMessage::Progress { job_id, progress } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(progress, 100);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            WorkerMessage::Log { message, .. } => assert_eq!(message, "halfway"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
