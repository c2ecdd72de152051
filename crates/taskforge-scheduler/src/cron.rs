//! 5-field cron expressions.
//!
//! Fields are `minute hour day-of-month month day-of-week`, evaluated in UTC.
//! A timestamp matches only when every field matches. Matching is delegated
//! to [`cron::Schedule`] after the expression is rewritten into its
//! seconds-first dialect.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule;

use crate::error::ScheduleError;

/// How far ahead [`CronExpression::next_after`] searches.
const SEARCH_HORIZON_DAYS: i64 = 366;

const PRESETS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: Schedule,
}

impl CronExpression {
    /// Parse an expression or one of the `@` presets.
    ///
    /// Each field accepts `*`, a value, a range `a-b`, a step (`*/n`, `a-b/n`,
    /// `a/n`) or a comma-separated list of those. Day-of-week takes 0-7 with
    /// both 0 and 7 meaning Sunday.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::CronParse`] for a wrong field count, an
    /// unknown preset, a malformed term or an out-of-range value.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let canonical = if trimmed.starts_with('@') {
            PRESETS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
                .map(|(_, canonical)| *canonical)
                .ok_or_else(|| ScheduleError::cron(expression, "unknown preset"))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = canonical.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::cron(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        for (field, name) in fields.iter().zip(FIELD_NAMES) {
            check_terms(expression, field, name)?;
        }

        let days_of_week = remap_days_of_week(expression, fields[4])?;
        let six_field = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], days_of_week
        );
        let schedule = Schedule::from_str(&six_field)
            .map_err(|e| ScheduleError::cron(expression, e.to_string()))?;

        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `at` (truncated to the minute) fires.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        at.with_second(0)
            .and_then(|minute| minute.with_nanosecond(0))
            .is_some_and(|minute| self.schedule.includes(minute))
    }

    /// First matching minute strictly after `from`, searching up to a year ahead.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = from + Duration::days(SEARCH_HORIZON_DAYS);
        self.schedule
            .after(&from)
            .next()
            .filter(|next| *next <= horizon)
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expression` and compute its next run after `from`.
pub fn calculate_next_run(
    expression: &str,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(CronExpression::parse(expression)?.next_after(from))
}

/// Reject zero steps and reversed numeric ranges.
fn check_terms(expression: &str, field: &str, name: &str) -> Result<(), ScheduleError> {
    for term in field.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (term, None),
        };
        if step.is_some_and(|step| step.parse::<u32>() == Ok(0)) {
            let reason = format!("{} step must be positive", name);
            return Err(ScheduleError::cron(expression, reason));
        }
        let bounds = range
            .split_once('-')
            .map(|(start, end)| (start.parse::<u32>(), end.parse::<u32>()));
        match bounds {
            Some((Ok(start), Ok(end))) if start > end => {
                return Err(ScheduleError::cron(
                    expression,
                    format!("{} range {}-{} is reversed", name, start, end),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Rewrite numeric day-of-week terms from 0-7 (0 and 7 = Sunday) to the
/// schedule parser's 1-7 (1 = Sunday). `*` and day names pass through.
fn remap_days_of_week(expression: &str, field: &str) -> Result<String, ScheduleError> {
    let mut terms = Vec::new();

    for term in field.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (term, None),
        };
        if !range.starts_with(|c: char| c.is_ascii_digit()) {
            terms.push(term.to_string());
            continue;
        }

        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (day_number(expression, start)?, day_number(expression, end)?),
            // `a/n` runs to the end of the week.
            None if step.is_some() => (day_number(expression, range)?, 7),
            None => {
                let day = day_number(expression, range)?;
                (day, day)
            }
        };
        let step_by = match step {
            Some(step) => step
                .parse::<u32>()
                .map_err(|_| ScheduleError::cron(expression, "invalid day-of-week step"))?,
            None => 1,
        };

        // Days 0-6 shift up by one; a trailing 7 folds onto Sunday.
        let last_weekday = end.min(6);
        if start <= last_weekday {
            let mut shifted = if start == last_weekday {
                (start + 1).to_string()
            } else {
                format!("{}-{}", start + 1, last_weekday + 1)
            };
            if let Some(step) = step.filter(|_| start < last_weekday) {
                shifted.push('/');
                shifted.push_str(step);
            }
            terms.push(shifted);
        }
        if end == 7 && (7 - start) % step_by == 0 {
            terms.push("1".to_string());
        }
    }

    Ok(terms.join(","))
}

fn day_number(expression: &str, raw: &str) -> Result<u32, ScheduleError> {
    match raw.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(ScheduleError::cron(
            expression,
            format!("invalid day-of-week value '{}'", raw),
        )),
    }
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
