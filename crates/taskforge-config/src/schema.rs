//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Database path, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.queue.db_path.clone().unwrap_or_else(default_db_path)
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent execution slots.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    /// Dispatcher poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base of the exponential retry backoff in milliseconds.
    #[serde(default = "default_retry_delay_base_ms")]
    pub retry_delay_base_ms: u64,

    /// Retries granted to jobs that don't specify their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Per-job execution deadline in seconds (0 = no deadline).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// SQLite database path.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_max_workers() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_delay_base_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskforge")
        .join("jobs.db")
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    /// Execution deadline, `None` when disabled.
    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_delay_base_ms: default_retry_delay_base_ms(),
            default_max_retries: default_max_retries(),
            job_timeout_secs: default_job_timeout_secs(),
            event_capacity: default_event_capacity(),
            db_path: None,
        }
    }
}

/// Recurring schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the schedule manager runs alongside the queue.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between schedule ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    60
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Directory for daily-rotated log files.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_dir: None,
        }
    }
}
