//! SQLite job store implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Row};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::job::{Job, JobCounts, JobFilter, JobPriority, JobStatus};
use crate::scheduled::ScheduledJob;
use crate::schema;
use crate::store::{JobStore, StatusFields};

#[cfg(test)]
#[path = "sqlite_store_tests.rs"]
mod tests;

const JOB_COLUMNS: &str = "j.id, j.job_type, j.payload, j.priority, j.status, j.scheduled_at, \
     j.started_at, j.completed_at, j.retry_count, j.max_retries, j.error, j.result, j.progress, \
     j.metadata, j.created_at, j.updated_at";

const SCHEDULE_COLUMNS: &str = "id, name, cron_expression, job_type, payload, priority, \
     max_retries, enabled, last_run, next_run, created_at, updated_at";

/// SQLite-based job store.
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| Ok(schema::migrate(conn)?)).await?;
        Ok(Self { conn })
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path.clone()).await?;
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            schema::migrate(conn)?;
            Ok(())
        })
        .await?;

        info!("Job store opened at {}", path.display());
        Ok(Self { conn })
    }
}

/// Timestamps are stored with fixed precision so lexical order is chronological.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    parse_json(idx, &raw)
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_json(idx, &s)).transpose()
}

fn priority_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobPriority> {
    let rank: i64 = row.get(idx)?;
    JobPriority::from_rank(rank)
        .ok_or_else(|| conversion_err(idx, format!("invalid priority rank {}", rank)))
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<JobStatus> {
    raw.parse::<JobStatus>().map_err(|e| conversion_err(idx, e.to_string()))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload: json_col(row, 2)?,
        priority: priority_col(row, 3)?,
        status: parse_status(4, &status)?,
        scheduled_at: opt_ts_col(row, 5)?,
        started_at: opt_ts_col(row, 6)?,
        completed_at: opt_ts_col(row, 7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        error: row.get(10)?,
        result: opt_json_col(row, 11)?,
        progress: row.get(12)?,
        metadata: json_col(row, 13)?,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expression: row.get(2)?,
        job_type: row.get(3)?,
        payload: json_col(row, 4)?,
        priority: priority_col(row, 5)?,
        max_retries: row.get(6)?,
        enabled: row.get(7)?,
        last_run: opt_ts_col(row, 8)?,
        next_run: opt_ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
    })
}

fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

/// Build the `SET` list and parameters for a status transition.
fn status_update_sql(
    id: &str,
    status: JobStatus,
    fields: StatusFields,
    now: DateTime<Utc>,
) -> Result<(String, Vec<Value>), QueueError> {
    let mut sets = vec!["status = ?1".to_string(), "updated_at = ?2".to_string()];
    let mut values = vec![text(status.as_str()), text(fmt_ts(now))];

    let reset = fields.reset;
    let mut assign = |column: &str, value: Option<Value>| match value {
        Some(v) => {
            values.push(v);
            sets.push(format!("{} = ?{}", column, values.len()));
        }
        None if reset => sets.push(format!("{} = NULL", column)),
        None => {}
    };

    assign("started_at", fields.started_at.map(|t| text(fmt_ts(t))));
    assign("completed_at", fields.completed_at.map(|t| text(fmt_ts(t))));
    assign("scheduled_at", fields.scheduled_at.map(|t| text(fmt_ts(t))));
    assign("error", fields.error.map(text));
    let result = fields.result.as_ref().map(serde_json::to_string).transpose()?;
    assign("result", result.map(text));

    if let Some(count) = fields.retry_count {
        values.push(Value::Integer(i64::from(count)));
        sets.push(format!("retry_count = ?{}", values.len()));
    }
    if let Some(progress) = fields.progress {
        values.push(Value::Integer(i64::from(progress)));
        sets.push(format!("progress = ?{}", values.len()));
    }

    values.push(text(id));
    let mut sql = format!("UPDATE jobs SET {} WHERE id = ?{}", sets.join(", "), values.len());

    if !fields.expect.is_empty() {
        let mut placeholders = Vec::with_capacity(fields.expect.len());
        for expected in &fields.expect {
            values.push(text(expected.as_str()));
            placeholders.push(format!("?{}", values.len()));
        }
        sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
    }

    Ok((sql, values))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &Job, depends_on: &[String]) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job.payload)?;
        let metadata = serde_json::to_string(&job.metadata)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let job = job.clone();
        let depends_on = depends_on.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                tx.execute(
                    "INSERT INTO jobs (id, job_type, payload, priority, status, scheduled_at,
                        started_at, completed_at, retry_count, max_retries, error, result,
                        progress, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                        ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    params![
                        job.id,
                        job.job_type,
                        payload,
                        job.priority.rank(),
                        job.status.as_str(),
                        job.scheduled_at.map(fmt_ts),
                        job.started_at.map(fmt_ts),
                        job.completed_at.map(fmt_ts),
                        job.retry_count,
                        job.max_retries,
                        job.error,
                        result,
                        job.progress,
                        metadata,
                        fmt_ts(job.created_at),
                        fmt_ts(job.updated_at),
                    ],
                )?;

                for dependency in &depends_on {
                    tx.execute(
                        "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on)
                         VALUES (?1, ?2)",
                        params![job.id, dependency],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let id = id.to_string();
        let job = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM jobs j WHERE j.id = ?1", JOB_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                match stmt.query_row([&id], job_from_row) {
                    Ok(job) => Ok(Some(job)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(status) = filter.status {
            values.push(text(status.as_str()));
            clauses.push(format!("j.status = ?{}", values.len()));
        }
        if let Some(job_type) = &filter.job_type {
            values.push(text(job_type.clone()));
            clauses.push(format!("j.job_type = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(Value::Integer(priority.rank()));
            clauses.push(format!("j.priority = ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        // LIMIT -1 means unbounded in SQLite.
        values.push(Value::Integer(filter.limit.map_or(-1, |l| l as i64)));
        let sql = format!(
            "SELECT {} FROM jobs j {} ORDER BY j.created_at DESC, j.rowid DESC LIMIT ?{}",
            JOB_COLUMNS,
            where_clause,
            values.len()
        );

        let jobs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map(params_from_iter(values), job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }

    async fn list_ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let now = fmt_ts(now);
        let limit = limit as i64;

        let jobs = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM jobs j
                     WHERE j.status IN ('pending', 'ready')
                       AND (j.scheduled_at IS NULL OR j.scheduled_at <= ?1)
                       AND NOT EXISTS (
                           SELECT 1 FROM job_dependencies d
                           LEFT JOIN jobs dep ON dep.id = d.depends_on
                           WHERE d.job_id = j.id
                             AND (dep.status IS NULL OR dep.status != 'completed')
                       )
                     ORDER BY j.priority DESC, j.created_at ASC, j.rowid ASC
                     LIMIT ?2",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map(params![now, limit], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<bool, QueueError> {
        let (sql, values) = status_update_sql(id, status, fields, Utc::now())?;

        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute(&sql, params_from_iter(values))?))
            .await?;

        debug!("Job {} -> {} ({} row(s))", id, status, changed);
        Ok(changed > 0)
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), QueueError> {
        let id = id.to_string();
        let now = fmt_ts(Utc::now());
        let progress = progress.min(100);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE jobs SET progress = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![progress, now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM job_dependencies WHERE job_id = ?1 OR depends_on = ?1",
                    [&id],
                )?;
                let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await?;
        Ok(deleted)
    }

    async fn insert_dependency(&self, job_id: &str, depends_on: &str) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        let depends_on = depends_on.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                    params![job_id, depends_on],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_dependencies(&self, job_id: &str) -> Result<Vec<String>, QueueError> {
        let job_id = job_id.to_string();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT depends_on FROM job_dependencies WHERE job_id = ?1 ORDER BY depends_on",
                )?;
                let ids = stmt
                    .query_map([&job_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn list_dependency_statuses(
        &self,
        job_id: &str,
    ) -> Result<Vec<(String, Option<JobStatus>)>, QueueError> {
        let job_id = job_id.to_string();
        let statuses = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT d.depends_on, dep.status FROM job_dependencies d
                     LEFT JOIN jobs dep ON dep.id = d.depends_on
                     WHERE d.job_id = ?1",
                )?;
                let rows = stmt
                    .query_map([&job_id], |row| {
                        let id: String = row.get(0)?;
                        let status: Option<String> = row.get(1)?;
                        let status = status.map(|s| parse_status(1, &s)).transpose()?;
                        Ok((id, status))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(statuses)
    }

    async fn list_dependents(&self, job_id: &str) -> Result<Vec<Job>, QueueError> {
        let job_id = job_id.to_string();
        let jobs = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM jobs j
                     JOIN job_dependencies d ON d.job_id = j.id
                     WHERE d.depends_on = ?1
                     ORDER BY j.created_at ASC, j.rowid ASC",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map([&job_id], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<JobCounts, QueueError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        let status: String = row.get(0)?;
                        let count: i64 = row.get(1)?;
                        Ok((parse_status(0, &status)?, count))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn reset_running_jobs(&self) -> Result<Vec<String>, QueueError> {
        let now = fmt_ts(Utc::now());
        let ids = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare("SELECT id FROM jobs WHERE status = 'running'")?;
                    stmt.query_map([], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?
                };
                tx.execute(
                    "UPDATE jobs
                     SET status = 'pending', started_at = NULL, progress = 0, updated_at = ?1
                     WHERE status = 'running'",
                    [&now],
                )?;
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let before = fmt_ts(before);
        let purged = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM job_dependencies
                     WHERE job_id IN (SELECT id FROM jobs
                                      WHERE status IN ('completed', 'failed')
                                        AND completed_at < ?1)
                        OR depends_on IN (SELECT id FROM jobs
                                          WHERE status IN ('completed', 'failed')
                                            AND completed_at < ?1)",
                    [&before],
                )?;
                let purged = tx.execute(
                    "DELETE FROM jobs
                     WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                    [&before],
                )?;
                tx.commit()?;
                Ok(purged as u64)
            })
            .await?;
        Ok(purged)
    }

    async fn upsert_scheduled_job(&self, schedule: &ScheduledJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&schedule.payload)?;
        let schedule = schedule.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO scheduled_jobs (id, name, cron_expression, job_type, payload,
                        priority, max_retries, enabled, last_run, next_run, created_at,
                        updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        cron_expression = excluded.cron_expression,
                        job_type = excluded.job_type,
                        payload = excluded.payload,
                        priority = excluded.priority,
                        max_retries = excluded.max_retries,
                        enabled = excluded.enabled,
                        last_run = excluded.last_run,
                        next_run = excluded.next_run,
                        updated_at = excluded.updated_at",
                    params![
                        schedule.id,
                        schedule.name,
                        schedule.cron_expression,
                        schedule.job_type,
                        payload,
                        schedule.priority.rank(),
                        schedule.max_retries,
                        schedule.enabled,
                        schedule.last_run.map(fmt_ts),
                        schedule.next_run.map(fmt_ts),
                        fmt_ts(schedule.created_at),
                        fmt_ts(schedule.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJob>, QueueError> {
        let id = id.to_string();
        self.query_one_schedule("id", id).await
    }

    async fn get_scheduled_job_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        let name = name.to_string();
        self.query_one_schedule("name", name).await
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, QueueError> {
        let sql = format!("SELECT {} FROM scheduled_jobs ORDER BY name ASC", SCHEDULE_COLUMNS);
        self.query_schedules(sql, Vec::new()).await
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, QueueError> {
        let sql = format!(
            "SELECT {} FROM scheduled_jobs
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC",
            SCHEDULE_COLUMNS
        );
        self.query_schedules(sql, vec![text(fmt_ts(now))]).await
    }

    async fn list_upcoming_schedules(&self, limit: usize) -> Result<Vec<ScheduledJob>, QueueError> {
        let sql = format!(
            "SELECT {} FROM scheduled_jobs
             WHERE enabled = 1 AND next_run IS NOT NULL
             ORDER BY next_run ASC LIMIT ?1",
            SCHEDULE_COLUMNS
        );
        self.query_schedules(sql, vec![Value::Integer(limit as i64)]).await
    }

    async fn delete_scheduled_job(&self, id: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", [&id])?))
            .await?;
        Ok(deleted > 0)
    }

    async fn count_scheduled_jobs(&self) -> Result<u64, QueueError> {
        let count: i64 = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM scheduled_jobs", [], |row| row.get(0))?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

impl SqliteJobStore {
    async fn query_schedules(
        &self,
        sql: String,
        values: Vec<Value>,
    ) -> Result<Vec<ScheduledJob>, QueueError> {
        let schedules = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let schedules = stmt
                    .query_map(params_from_iter(values), schedule_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(schedules)
            })
            .await?;
        Ok(schedules)
    }

    async fn query_one_schedule(
        &self,
        column: &'static str,
        value: String,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        let sql = format!("SELECT {} FROM scheduled_jobs WHERE {} = ?1", SCHEDULE_COLUMNS, column);
        Ok(self.query_schedules(sql, vec![text(value)]).await?.into_iter().next())
    }
}
