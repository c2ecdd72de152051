//! Job subcommand handlers for TaskForge.

use std::time::Duration;

use anyhow::Context;

use taskforge_config::Config;
use taskforge_queue::{EnqueueOptions, Job, JobFilter, JobPriority, JobStatus};

use crate::server::open_queue;

/// Parse a JSON payload argument.
pub(crate) fn parse_payload(payload: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(payload).with_context(|| format!("Invalid JSON payload: {}", payload))
}

pub(crate) async fn enqueue(
    config: &Config,
    job_type: &str,
    payload: &str,
    priority: &str,
    delay_ms: Option<u64>,
    max_retries: Option<u32>,
    depends_on: Vec<String>,
) -> anyhow::Result<()> {
    let payload = parse_payload(payload)?;
    let priority: JobPriority = priority.parse()?;

    let mut options = EnqueueOptions::new().priority(priority);
    if let Some(ms) = delay_ms {
        options = options.delay(Duration::from_millis(ms));
    }
    if let Some(max) = max_retries {
        options = options.max_retries(max);
    }
    for dependency in depends_on {
        options = options.depends_on(dependency);
    }

    let queue = open_queue(config).await?;
    let id = queue.enqueue(job_type, payload, options).await?;
    println!("{}", id);
    Ok(())
}

pub(crate) async fn show_job(config: &Config, id: &str) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let job = queue
        .get_job(id)
        .await?
        .with_context(|| format!("Job not found: {}", id))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub(crate) async fn list_jobs(
    config: &Config,
    status: Option<String>,
    job_type: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut filter = JobFilter::default().limit(limit);
    if let Some(status) = status {
        filter = filter.status(status.parse::<JobStatus>()?);
    }
    if let Some(job_type) = job_type {
        filter = filter.job_type(job_type);
    }

    let queue = open_queue(config).await?;
    let jobs = queue.get_jobs(&filter).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16} {:<9} {:<10} {:>7}  {}",
        "ID", "TYPE", "PRIORITY", "STATUS", "RETRIES", "CREATED"
    );
    println!("{}", "-".repeat(110));
    for job in &jobs {
        print_row(job);
    }
    Ok(())
}

fn print_row(job: &Job) {
    println!(
        "{:<36}  {:<16} {:<9} {:<10} {:>3}/{:<3}  {}",
        job.id,
        job.job_type,
        job.priority.as_str(),
        job.status.as_str(),
        job.retry_count,
        job.max_retries,
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

pub(crate) async fn stats(config: &Config) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let stats = queue.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub(crate) async fn retry(config: &Config, id: &str) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    queue.retry_job(id).await?;
    println!("Job {} queued for retry", id);
    Ok(())
}

pub(crate) async fn cancel(config: &Config, id: &str) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    queue.cancel_job(id).await?;
    println!("Job {} cancelled", id);
    Ok(())
}
