//! Logging setup and the foreground `run` command.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use taskforge_config::{Config, LoggingConfig};
use taskforge_queue::{HandlerRegistry, JobQueue, SqliteJobStore};
use taskforge_scheduler::ScheduleManager;

use crate::register::register_builtin_handlers;

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing with console output and an optional daily-rolled log file.
///
/// `RUST_LOG` takes precedence over the configured level.
pub(crate) fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let file_writer = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("taskforge")
                .filename_suffix("log")
                .max_log_files(30)
                .build(dir)
                .context("Failed to create log file appender")?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = GUARD.set(guard);
            Some(non_blocking)
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(|| fmt::layer().with_target(true).with_ansi(true)))
        .with(file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false)))
        .init();

    Ok(())
}

/// Open the configured store and build a queue with the built-in handlers.
pub(crate) async fn open_queue(config: &Config) -> anyhow::Result<Arc<JobQueue>> {
    let path = config.database_path();
    let store = SqliteJobStore::open(&path)
        .await
        .with_context(|| format!("Failed to open job store at {}", path.display()))?;

    let registry = HandlerRegistry::new();
    register_builtin_handlers(&registry);

    Ok(Arc::new(JobQueue::new(
        config.queue.clone(),
        Arc::new(store),
        Arc::new(registry),
    )))
}

/// Run the queue and the scheduler until Ctrl-C.
pub(crate) async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting TaskForge v{}", env!("CARGO_PKG_VERSION"));

    let queue = open_queue(&config).await?;
    queue.start().await.context("Failed to start job queue")?;

    let scheduler = if config.scheduler.enabled {
        let manager = ScheduleManager::new(queue.clone(), config.scheduler.clone());
        manager.start().context("Failed to start schedule manager")?;
        Some(manager)
    } else {
        info!("Schedule manager disabled");
        None
    };

    info!(
        "Processing jobs with {} worker(s), press Ctrl-C to stop",
        config.queue.max_workers
    );

    supervise(&queue, scheduler.as_ref(), tokio::signal::ctrl_c()).await?;

    info!("TaskForge stopped");
    Ok(())
}

/// Wait for `shutdown` or for either background loop to die, then stop both.
///
/// Returns the error that ended the queue or the scheduler, if any.
async fn supervise(
    queue: &JobQueue,
    scheduler: Option<&ScheduleManager>,
    shutdown: impl Future<Output = std::io::Result<()>>,
) -> anyhow::Result<()> {
    let mut events = queue.subscribe();
    let queue_closed = queue.closed();
    let scheduler_closed = async {
        match scheduler {
            Some(manager) => manager.closed().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(shutdown, queue_closed, scheduler_closed);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutdown signal received");
                break;
            }
            _ = &mut queue_closed => {
                error!("Job queue stopped unexpectedly, shutting down");
                break;
            }
            _ = &mut scheduler_closed => {
                error!("Schedule manager stopped unexpectedly, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => debug!("{} {}", event.kind(), event.job_id()),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} event(s)", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let scheduler_result = match scheduler {
        Some(manager) => manager.stop().await,
        None => Ok(()),
    };
    let queue_result = queue.stop().await;
    scheduler_result.context("Schedule manager failed")?;
    queue_result.context("Job queue failed")?;
    Ok(())
}
