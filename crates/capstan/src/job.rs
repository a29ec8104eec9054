//! Job model for durable background execution.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a job.
///
/// ```text
///           create                claim
///   (none) ───────► Pending ────────────► Running
///                      ▲                    │
///        retry with    │                    │ handler ok
///        backoff       │                    ▼
///                      │               Completed (terminal)
///                      │
///        fail, attempts < max
///                      └─── fail, attempts ≥ max ──► Failed (terminal)
/// ```
///
/// A stale sweep returns abandoned Running jobs to Pending; a kill moves a
/// Running job straight to Failed with the kill reason recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single durable unit of work.
///
/// The payload is stored verbatim and round-trips unchanged. `worker_id` is
/// present exactly while the job is Running (modulo the instant of the atomic
/// claim/release itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Handler key; execution requires a matching registered handler.
    pub task_name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Earliest wall-clock time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Incremented by the claim itself, so a crashed worker still consumes
    /// an attempt.
    pub attempts_made: i32,
    pub max_attempts: i32,
    /// Reason for the most recent failure; may be present on a Pending job
    /// during retry backoff.
    pub last_error: Option<String>,
    /// Completion percentage in [0, 100], monotone within a Running interval.
    pub progress: i32,
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Reference to the stored result; set on Completed.
    pub result_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
}

impl Job {
    /// Whether a retry remains after the current attempt fails.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Seconds of exponential backoff applied after the current attempt
    /// fails: `2^attempts_made`, capped at one hour.
    pub fn backoff_seconds(&self) -> i64 {
        2i64.saturating_pow(self.attempts_made.max(0) as u32).min(3600)
    }
}

/// Options accepted when admitting a job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: i32,
    /// Earliest time the job may run; defaults to now.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            run_at: None,
            max_attempts: 3,
            webhook_url: None,
            webhook_headers: None,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_webhook(
        mut self,
        url: impl Into<String>,
        headers: Option<HashMap<String, String>>,
    ) -> Self {
        self.webhook_url = Some(url.into());
        self.webhook_headers = headers;
        self
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_name: Option<String>,
    pub worker_id: Option<String>,
    /// Maximum rows returned; adapters default to 100 when unset.
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn by_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn by_task(task_name: impl Into<String>) -> Self {
        Self {
            task_name: Some(task_name.into()),
            ..Default::default()
        }
    }
}

/// Aggregate queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Liveness record upserted by workers on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub current_job_id: Option<Uuid>,
}

/// A job joined with its stored result and owning worker's liveness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedJobInfo {
    pub job: Job,
    pub result: Option<serde_json::Value>,
    pub worker: Option<WorkerHeartbeat>,
}
