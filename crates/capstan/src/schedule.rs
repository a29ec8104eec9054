//! Scheduled job definitions: one-time and cron-recurring entries the
//! scheduler materializes into real jobs when due.
//!
//! A schedule never executes anything itself; firing creates a fresh
//! [`Job`](crate::job::Job) whose lifecycle is then independent of the
//! schedule that produced it.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    OneTime,
    Recurring,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Recurring => "recurring",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(Self::OneTime),
            "recurring" => Ok(Self::Recurring),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Scheduled,
    Paused,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A declarative rule that materializes jobs when due.
///
/// One-time entries carry `run_at` and fire at most once. Recurring entries
/// carry a 5-field Unix cron `pattern` (evaluated in UTC) with optional
/// start/end bounds; `next_run_at` is present exactly while the entry is
/// Scheduled and occurrences remain before `end_date`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub kind: ScheduleKind,
    pub status: ScheduleStatus,
    /// One-time entries only.
    pub run_at: Option<DateTime<Utc>>,
    /// Recurring entries only.
    pub pattern: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_attempts: i32,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options shared by schedule creation operations.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub priority: i32,
    pub max_attempts: Option<i32>,
    /// Recurring entries: do not fire before this time.
    pub start_date: Option<DateTime<Utc>>,
    /// Recurring entries: no occurrence after this time.
    pub end_date: Option<DateTime<Utc>>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update applied by `update_schedule`. `None` fields are unchanged.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub payload: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    /// One-time entries only; must not be in the past.
    pub run_at: Option<DateTime<Utc>>,
    /// Recurring entries only; re-validated and next fire recomputed.
    pub pattern: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Filter for listing schedules.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub status: Option<ScheduleStatus>,
    pub kind: Option<ScheduleKind>,
    pub task_name: Option<String>,
    pub limit: Option<i64>,
}

/// Parse a standard 5-field Unix cron pattern.
///
/// The `cron` crate wants a seconds column, so a literal `0` is prepended
/// after validating the field count; evaluation is pinned to UTC by the
/// callers below.
pub fn parse_pattern(pattern: &str) -> Result<CronSchedule> {
    let fields = pattern.split_whitespace().count();
    if fields != 5 {
        return Err(Error::InvalidCronPattern {
            pattern: pattern.to_string(),
            reason: format!("expected 5 fields (minute hour day month weekday), got {fields}"),
        });
    }
    CronSchedule::from_str(&format!("0 {pattern}")).map_err(|e| Error::InvalidCronPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Compute the next occurrence of `pattern` strictly after `after`, honoring
/// the optional `[start_date, end_date]` bounds. `Ok(None)` means no
/// occurrence remains.
pub fn next_occurrence(
    pattern: &str,
    after: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_pattern(pattern)?;
    let from = match start_date {
        // `after()` is exclusive, so step just behind an exact start bound.
        Some(start) if start > after => start - chrono::Duration::seconds(1),
        _ => after,
    };
    let next = schedule.after(&from).next();
    Ok(next.filter(|t| end_date.map_or(true, |end| *t <= end)))
}
