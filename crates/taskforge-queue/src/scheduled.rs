//! Recurring job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobPriority;

/// A cron-driven template that periodically produces new jobs.
///
/// Cron parsing and next-run computation live in the scheduler crate; the
/// queue only persists the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    pub cron_expression: String,
    pub job_type: String,
    /// Payload copied into every produced job.
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    /// Retry budget for produced jobs (None = queue default).
    pub max_retries: Option<u32>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            max_retries: None,
            enabled: true,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled and past its next run time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }
}
