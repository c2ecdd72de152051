//! # TaskForge Scheduler
//!
//! Recurring jobs driven by 5-field cron expressions. Each trigger enqueues a
//! regular job through [`taskforge_queue::JobQueue::enqueue`].

pub mod cron;
pub mod error;
pub mod manager;

pub use self::cron::{CronExpression, calculate_next_run};
pub use error::ScheduleError;
pub use manager::{NewSchedule, ScheduleManager, ScheduleUpdate};
pub use taskforge_config::SchedulerConfig;
