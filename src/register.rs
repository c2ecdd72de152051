//! Built-in job handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use taskforge_queue::{HandlerError, HandlerRegistry, HandlerResult, JobContext, JobHandler};

/// Sleeps for `payload.duration` milliseconds, reporting progress in tenths.
///
/// `payload.ms` is accepted as an alias.
struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, payload: serde_json::Value, ctx: JobContext) -> HandlerResult {
        let ms = payload
            .get("duration")
            .or_else(|| payload.get("ms"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HandlerError::from("payload.duration must be a non-negative integer"))?;

        let step = Duration::from_millis(ms / 10);
        for tenth in 1..=10u8 {
            tokio::time::sleep(step).await;
            ctx.update_progress(tenth * 10);
        }

        Ok(json!({ "slept_ms": ms }))
    }
}

async fn echo(payload: serde_json::Value, ctx: JobContext) -> HandlerResult {
    ctx.log(format!("echo attempt {}", ctx.attempt()));
    Ok(payload)
}

/// Register the handlers shipped with the binary.
pub(crate) fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry.register("sleep", Arc::new(SleepHandler));
    registry.register_fn("echo", echo);
    info!("Registered job types: {}", registry.types().join(", "));
}
