//! Storage adapter contract.
//!
//! The entire core depends only on these traits. Any implementation
//! (relational, document, in-memory) that honors the atomicity and ordering
//! rules below is acceptable.
//!
//! # Claim atomicity
//!
//! [`StorageAdapter::fetch_next_job`] is the heart of the contract: it must
//! select the best ready job, transition it to Running, stamp the worker id
//! and heartbeat, and increment `attempts_made` — all in one atomic unit, and
//! it must never hand the same job to two callers. SQL stores should use
//! `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction; other stores an
//! equivalent compare-and-swap discipline.
//!
//! # Ordering
//!
//! Ready jobs are claimed in `priority DESC, run_at ASC, created_at ASC`
//! order, ties broken by id. The claim filter also accepts Running jobs whose
//! `last_heartbeat` is older than the stale threshold, so a crashed worker's
//! job can be re-acquired before any sweep runs.
//!
//! # Failure semantics
//!
//! Every operation either succeeds or raises [`Error::Storage`]; partial
//! mutation must not be observable. A batch claim is all-or-nothing for the
//! claim itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{DetailedJobInfo, Job, JobFilter, JobOptions, JobStatus, QueueStats};
use crate::schedule::{Schedule, ScheduleFilter, ScheduleStatus};

/// Running jobs whose last heartbeat is older than this are considered
/// abandoned and eligible for re-claim and sweep.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Options for bulk removal of jobs in a given status.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Only remove jobs last updated before this time.
    pub older_than: Option<DateTime<Utc>>,
    /// Also delete stored results referenced by the removed jobs.
    pub purge_results: bool,
}

/// Durable persistence for jobs, results and worker liveness.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Establish the connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Persist a new Pending job.
    async fn create_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job>;

    /// Atomically claim the best ready job whose task is in
    /// `available_tasks`, or `None` when nothing is ready.
    async fn fetch_next_job(
        &self,
        worker_id: &str,
        available_tasks: &[String],
    ) -> Result<Option<Job>>;

    /// Same semantics as [`Self::fetch_next_job`] for up to `batch_size`
    /// jobs in one atomic unit.
    async fn fetch_next_batch(
        &self,
        worker_id: &str,
        available_tasks: &[String],
        batch_size: i64,
    ) -> Result<Vec<Job>>;

    /// Transition a job to Completed, recording its result key and
    /// completion time and releasing the worker.
    async fn complete_job(&self, job_id: Uuid, result_key: Option<&str>) -> Result<()>;

    /// Record a handler failure and apply the retry policy: back to Pending
    /// with `run_at = now + 2^attempts_made` seconds while attempts remain,
    /// terminal Failed otherwise. `last_error` is set either way.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Directly set a job's status (and optionally `last_error`), stamping
    /// `completed_at` when the status is terminal. Used by kill and
    /// administrative paths; does not apply retry policy. A job already in a
    /// terminal state is left untouched — the first terminal write wins.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Record progress in [0, 100]. Values are clamped and never decrease
    /// while the job is Running.
    async fn update_job_progress(&self, job_id: Uuid, progress: i32) -> Result<()>;

    /// Set the status of many jobs at once; returns how many changed.
    async fn update_jobs_batch(
        &self,
        job_ids: &[Uuid],
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<u64>;

    /// Upsert worker liveness, and refresh the job's `last_heartbeat` when
    /// `job_id` names a job this worker is running.
    async fn heartbeat(&self, worker_id: &str, job_id: Option<Uuid>) -> Result<()>;

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Bulk-remove jobs in `status`; returns how many were removed.
    async fn remove_jobs_by_status(&self, status: JobStatus, opts: RemoveOptions) -> Result<u64>;

    /// A job joined with its result and its worker's liveness record.
    async fn get_detailed_job_info(&self, job_id: Uuid) -> Result<Option<DetailedJobInfo>>;

    /// Store a result blob for a job; returns the generated key.
    async fn store_result(&self, job_id: Uuid, value: serde_json::Value) -> Result<String>;

    /// Fetch a stored result by key.
    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Release jobs abandoned by dead workers: Running jobs whose last
    /// heartbeat is older than the stale threshold go back to Pending with
    /// `worker_id` cleared. A stale job whose crashed claim consumed the
    /// final attempt is instead failed terminally, since its retry budget
    /// would make it unclaimable forever. Returns how many jobs were swept.
    async fn cleanup_stale_jobs(&self) -> Result<u64>;

    async fn get_queue_stats(&self) -> Result<QueueStats>;
}

/// Capability extension for stores that also persist schedules.
///
/// The queue exposes its scheduling surface only for stores implementing
/// this trait; a plain [`StorageAdapter`] still supports the full job
/// lifecycle.
#[async_trait]
pub trait SchedulerStore: StorageAdapter {
    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>>;

    /// Persist all mutable fields of `schedule`, bumping `updated_at`.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule>;

    /// Delete schedules in `status` last updated before `before`; returns
    /// how many were deleted.
    async fn delete_schedules(
        &self,
        status: ScheduleStatus,
        before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Due entries at `now`: one-time with `run_at <= now` plus recurring
    /// with `next_run_at <= now`, all in Scheduled status.
    async fn get_schedules_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;
}
