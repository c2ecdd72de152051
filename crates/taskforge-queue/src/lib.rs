//! # TaskForge Queue
//!
//! Persistent, priority-aware background job processing.
//!
//! ## Features
//!
//! - Durable job storage (SQLite) with versioned schema
//! - Priority dispatch with FIFO ordering inside a priority tier
//! - Bounded worker pool with isolated execution units
//! - Retry with exponential backoff
//! - Job dependencies (DAG) with cycle rejection
//! - Typed event stream

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod scheduled;
mod schema;
pub mod sqlite_store;
pub mod store;
pub mod worker;

pub use dispatcher::{Dispatcher, retry_delay};
pub use error::QueueError;
pub use events::{EventBus, JobEvent};
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, JobContext, JobHandler};
pub use job::{EnqueueOptions, Job, JobCounts, JobFilter, JobPriority, JobStatus};
pub use queue::{JobQueue, QueueStats, WorkerStats};
pub use scheduled::ScheduledJob;
pub use sqlite_store::SqliteJobStore;
pub use store::{JobStore, StatusFields};
pub use taskforge_config::QueueConfig;
pub use worker::{JobOutcome, SlotState, WorkerMessage, WorkerPool};
