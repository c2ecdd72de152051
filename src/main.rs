//! TaskForge - persistent priority job queue.
//!
//! Main entry point for the TaskForge CLI and worker process.

mod cli;
mod cmd_job;
mod cmd_schedule;
mod register;
mod server;

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use taskforge_config::{ConfigLoader, ConfigValidator};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let warnings = ConfigValidator::validate(&config)
        .into_result()
        .context("Invalid configuration")?;

    server::init_tracing(&config.logging)?;
    for warning in warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => server::run(config).await,
        Commands::Enqueue {
            job_type,
            payload,
            priority,
            delay_ms,
            max_retries,
            depends_on,
        } => {
            cmd_job::enqueue(
                &config,
                &job_type,
                &payload,
                &priority,
                delay_ms,
                max_retries,
                depends_on,
            )
            .await
        }
        Commands::Job { id } => cmd_job::show_job(&config, &id).await,
        Commands::Jobs {
            status,
            job_type,
            limit,
        } => cmd_job::list_jobs(&config, status, job_type, limit).await,
        Commands::Stats => cmd_job::stats(&config).await,
        Commands::Retry { id } => cmd_job::retry(&config, &id).await,
        Commands::Cancel { id } => cmd_job::cancel(&config, &id).await,
        Commands::Schedule { action } => {
            cmd_schedule::handle_schedule_command(action, &config).await
        }
    }
}
