//! CLI definitions for TaskForge.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TaskForge CLI.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Persistent priority job queue with cron schedules")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "taskforge.toml", global = true, env = "TASKFORGE_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the queue and the scheduler in foreground (default)
    Run,

    /// Add a job to the queue
    Enqueue {
        /// Job type
        job_type: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        /// Priority (critical, high, normal, low)
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Delay before the job becomes eligible, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Retry budget (defaults to the configured value)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Jobs that must complete first
        #[arg(long = "depends-on", num_args = 1..)]
        depends_on: Vec<String>,
    },

    /// Show a job
    Job {
        /// Job ID
        id: String,
    },

    /// List jobs, newest first
    Jobs {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,

        /// Filter by job type
        #[arg(long = "type")]
        job_type: Option<String>,

        /// Maximum number of jobs
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show queue statistics
    Stats,

    /// Re-run a failed job
    Retry {
        /// Job ID
        id: String,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },

    /// Scheduled job management
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ScheduleAction {
    /// Create a scheduled job
    Create {
        /// Unique name
        name: String,

        /// Five-field cron expression or preset (@daily, @hourly, ...)
        cron: String,

        /// Job type produced on each run
        job_type: String,

        /// JSON payload copied into each produced job
        #[arg(default_value = "{}")]
        payload: String,

        /// Priority of produced jobs
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Retry budget of produced jobs
        #[arg(long)]
        max_retries: Option<u32>,

        /// Create without scheduling
        #[arg(long)]
        disabled: bool,
    },

    /// List scheduled jobs
    List,

    /// Delete a scheduled job
    Delete {
        /// Scheduled job ID
        id: String,
    },

    /// Enable a scheduled job
    Enable {
        /// Scheduled job ID
        id: String,
    },

    /// Disable a scheduled job
    Disable {
        /// Scheduled job ID
        id: String,
    },

    /// Show the next scheduled runs
    Upcoming {
        /// Number of schedules to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}
