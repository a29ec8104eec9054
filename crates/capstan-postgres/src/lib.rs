//! PostgreSQL implementation of the capstan storage contract.
//!
//! # Features
//!
//! - Atomic claims with `FOR UPDATE SKIP LOCKED`
//! - Stale-aware claim filter: abandoned Running jobs are re-acquirable
//!   without waiting for a sweep
//! - Exponential backoff retry handling inside the store
//! - Worker heartbeat upserts and stale-job recovery
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     task_name TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     attempts_made INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     last_error TEXT,
//!     progress INTEGER NOT NULL DEFAULT 0,
//!     worker_id TEXT,
//!     last_heartbeat TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     completed_at TIMESTAMPTZ,
//!     result_key TEXT,
//!     webhook_url TEXT,
//!     webhook_headers JSONB
//! );
//!
//! CREATE INDEX idx_jobs_ready ON jobs (status, run_at, priority);
//! CREATE INDEX idx_jobs_task_status ON jobs (task_name, status);
//! CREATE INDEX idx_jobs_worker ON jobs (worker_id);
//! ```
//!
//! plus `job_results`, `worker_heartbeats` and `scheduled_jobs` — see
//! [`PgStore::ensure_schema`] for the full idempotent DDL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use capstan::Queue;
//! use capstan_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgStore::new(pool);
//! store.ensure_schema().await?;
//!
//! let queue = Queue::new(store);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use capstan::{
    DetailedJobInfo, Error, Job, JobFilter, JobOptions, JobStatus, QueueStats, RemoveOptions,
    Result, Schedule, ScheduleFilter, ScheduleKind, ScheduleStatus, SchedulerStore,
    StorageAdapter, WorkerHeartbeat, DEFAULT_STALE_THRESHOLD,
};

const JOB_COLUMNS: &str = "id, task_name, payload, status, priority, run_at, attempts_made, \
     max_attempts, last_error, progress, worker_id, last_heartbeat, created_at, updated_at, \
     completed_at, result_key, webhook_url, webhook_headers";

const SCHEDULE_COLUMNS: &str = "id, task_name, payload, kind, status, run_at, pattern, \
     start_date, end_date, last_run_at, next_run_at, priority, max_attempts, webhook_url, \
     webhook_headers, metadata, created_at, updated_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    task_name TEXT NOT NULL,
    payload JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    attempts_made INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    last_error TEXT,
    progress INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    last_heartbeat TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    result_key TEXT,
    webhook_url TEXT,
    webhook_headers JSONB
);

CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs (status, run_at, priority);
CREATE INDEX IF NOT EXISTS idx_jobs_task_status ON jobs (task_name, status);
CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs (worker_id);

CREATE TABLE IF NOT EXISTS job_results (
    key TEXT PRIMARY KEY,
    job_id UUID NOT NULL,
    result JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT PRIMARY KEY,
    last_seen TIMESTAMPTZ NOT NULL,
    current_job_id UUID
);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id UUID PRIMARY KEY,
    task_name TEXT NOT NULL,
    payload JSONB NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    run_at TIMESTAMPTZ,
    pattern TEXT,
    start_date TIMESTAMPTZ,
    end_date TIMESTAMPTZ,
    last_run_at TIMESTAMPTZ,
    next_run_at TIMESTAMPTZ,
    priority INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    webhook_url TEXT,
    webhook_headers JSONB,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_scheduled_next_run ON scheduled_jobs (status, next_run_at);
CREATE INDEX IF NOT EXISTS idx_scheduled_run_at ON scheduled_jobs (status, run_at);
"#;

/// PostgreSQL storage adapter.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    stale_threshold: Duration,
}

impl PgStore {
    /// Create a store over an existing pool with the default 5 minute stale
    /// threshold.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Override how long a Running job may go without a heartbeat before it
    /// is considered abandoned.
    pub fn with_stale_threshold(pool: PgPool, stale_threshold: Duration) -> Self {
        Self {
            pool,
            stale_threshold,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(Error::storage)?;
        }
        Ok(())
    }

    fn stale_secs(&self) -> f64 {
        self.stale_threshold.as_secs_f64()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status").map_err(Error::storage)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| Error::storage(anyhow::anyhow!(e)))?;
    let webhook_headers: Option<serde_json::Value> =
        row.try_get("webhook_headers").map_err(Error::storage)?;

    Ok(Job {
        id: row.try_get("id").map_err(Error::storage)?,
        task_name: row.try_get("task_name").map_err(Error::storage)?,
        payload: row.try_get("payload").map_err(Error::storage)?,
        status,
        priority: row.try_get("priority").map_err(Error::storage)?,
        run_at: row.try_get("run_at").map_err(Error::storage)?,
        attempts_made: row.try_get("attempts_made").map_err(Error::storage)?,
        max_attempts: row.try_get("max_attempts").map_err(Error::storage)?,
        last_error: row.try_get("last_error").map_err(Error::storage)?,
        progress: row.try_get("progress").map_err(Error::storage)?,
        worker_id: row.try_get("worker_id").map_err(Error::storage)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        updated_at: row.try_get("updated_at").map_err(Error::storage)?,
        completed_at: row.try_get("completed_at").map_err(Error::storage)?,
        result_key: row.try_get("result_key").map_err(Error::storage)?,
        webhook_url: row.try_get("webhook_url").map_err(Error::storage)?,
        webhook_headers: webhook_headers.and_then(|v| serde_json::from_value(v).ok()),
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule> {
    let kind: String = row.try_get("kind").map_err(Error::storage)?;
    let kind = kind
        .parse::<ScheduleKind>()
        .map_err(|e| Error::storage(anyhow::anyhow!(e)))?;
    let status: String = row.try_get("status").map_err(Error::storage)?;
    let status = status
        .parse::<ScheduleStatus>()
        .map_err(|e| Error::storage(anyhow::anyhow!(e)))?;
    let webhook_headers: Option<serde_json::Value> =
        row.try_get("webhook_headers").map_err(Error::storage)?;

    Ok(Schedule {
        id: row.try_get("id").map_err(Error::storage)?,
        task_name: row.try_get("task_name").map_err(Error::storage)?,
        payload: row.try_get("payload").map_err(Error::storage)?,
        kind,
        status,
        run_at: row.try_get("run_at").map_err(Error::storage)?,
        pattern: row.try_get("pattern").map_err(Error::storage)?,
        start_date: row.try_get("start_date").map_err(Error::storage)?,
        end_date: row.try_get("end_date").map_err(Error::storage)?,
        last_run_at: row.try_get("last_run_at").map_err(Error::storage)?,
        next_run_at: row.try_get("next_run_at").map_err(Error::storage)?,
        priority: row.try_get("priority").map_err(Error::storage)?,
        max_attempts: row.try_get("max_attempts").map_err(Error::storage)?,
        webhook_url: row.try_get("webhook_url").map_err(Error::storage)?,
        webhook_headers: webhook_headers.and_then(|v| serde_json::from_value(v).ok()),
        metadata: row.try_get("metadata").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        updated_at: row.try_get("updated_at").map_err(Error::storage)?,
    })
}

fn headers_json(headers: &Option<std::collections::HashMap<String, String>>) -> Option<serde_json::Value> {
    headers
        .as_ref()
        .map(|h| serde_json::to_value(h).unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl StorageAdapter for PgStore {
    /// The pool connects lazily; this just verifies the database answers.
    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn create_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, task_name, payload, status, priority, run_at, max_attempts,
                              webhook_url, webhook_headers)
            VALUES ($1, $2, $3, 'pending', $4, COALESCE($5, NOW()), $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(task_name)
        .bind(&payload)
        .bind(options.priority)
        .bind(options.run_at)
        .bind(options.max_attempts.max(1))
        .bind(&options.webhook_url)
        .bind(headers_json(&options.webhook_headers))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::storage)?;

        job_from_row(&row)
    }

    /// Claim with `FOR UPDATE SKIP LOCKED`. The filter also picks up Running
    /// jobs whose heartbeat went stale, so a crashed worker's job is
    /// re-acquirable without waiting for a sweep.
    async fn fetch_next_job(
        &self,
        worker_id: &str,
        available_tasks: &[String],
    ) -> Result<Option<Job>> {
        let jobs = self.claim(worker_id, available_tasks, 1).await?;
        Ok(jobs.into_iter().next())
    }

    async fn fetch_next_batch(
        &self,
        worker_id: &str,
        available_tasks: &[String],
        batch_size: i64,
    ) -> Result<Vec<Job>> {
        self.claim(worker_id, available_tasks, batch_size.max(0))
            .await
    }

    async fn complete_job(&self, job_id: Uuid, result_key: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result_key = $2,
                worker_id = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(result_key)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    /// Apply the retry policy under a row lock: Pending with exponential
    /// backoff while attempts remain, terminal Failed otherwise.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;

        let row = sqlx::query(
            "SELECT attempts_made, max_attempts, status FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::storage)?
        .ok_or(Error::JobNotFound(job_id))?;

        let attempts_made: i32 = row.try_get("attempts_made").map_err(Error::storage)?;
        let max_attempts: i32 = row.try_get("max_attempts").map_err(Error::storage)?;
        let status: String = row.try_get("status").map_err(Error::storage)?;

        if status == "completed" || status == "failed" {
            // First terminal write wins.
            tx.commit().await.map_err(Error::storage)?;
            return Ok(());
        }

        if attempts_made < max_attempts {
            let delay_secs = 2i64.saturating_pow(attempts_made.max(0) as u32).min(3600);
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    run_at = NOW() + make_interval(secs => $2),
                    last_error = $3,
                    worker_id = NULL,
                    last_heartbeat = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(delay_secs as f64)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $2,
                    worker_id = NULL,
                    last_heartbeat = NULL,
                    completed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        }

        tx.commit().await.map_err(Error::storage)?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                last_error = COALESCE($3, last_error),
                worker_id = CASE WHEN $2 = 'running' THEN worker_id ELSE NULL END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    async fn update_job_progress(&self, job_id: Uuid, progress: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = GREATEST(progress, LEAST(100, GREATEST(0, $2))),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(progress)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    async fn update_jobs_batch(
        &self,
        job_ids: &[Uuid],
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                last_error = COALESCE($3, last_error),
                worker_id = CASE WHEN $2 = 'running' THEN worker_id ELSE NULL END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = ANY($1) AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(job_ids)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(result.rows_affected())
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Option<Uuid>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, last_seen, current_job_id)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (worker_id)
            DO UPDATE SET last_seen = NOW(), current_job_id = EXCLUDED.current_job_id
            "#,
        )
        .bind(worker_id)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        if let Some(job_id) = job_id {
            sqlx::query(
                r#"
                UPDATE jobs
                SET last_heartbeat = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'running' AND worker_id = $2
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        }
        Ok(())
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR task_name = $2)
              AND ($3::text IS NULL OR worker_id = $3)
            ORDER BY created_at DESC, id
            LIMIT $4
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.task_name)
        .bind(&filter.worker_id)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn remove_jobs_by_status(&self, status: JobStatus, opts: RemoveOptions) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;

        if opts.purge_results {
            sqlx::query(
                r#"
                DELETE FROM job_results
                WHERE job_id IN (
                    SELECT id FROM jobs
                    WHERE status = $1 AND ($2::timestamptz IS NULL OR updated_at < $2)
                )
                "#,
            )
            .bind(status.as_str())
            .bind(opts.older_than)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        }

        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = $1 AND ($2::timestamptz IS NULL OR updated_at < $2)",
        )
        .bind(status.as_str())
        .bind(opts.older_than)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        tx.commit().await.map_err(Error::storage)?;
        Ok(result.rows_affected())
    }

    async fn get_detailed_job_info(&self, job_id: Uuid) -> Result<Option<DetailedJobInfo>> {
        let Some(job) = self.get_job_by_id(job_id).await? else {
            return Ok(None);
        };

        let result = match job.result_key.as_deref() {
            Some(key) => self.get_result(key).await?,
            None => None,
        };

        let worker = match job.worker_id.as_deref() {
            Some(worker_id) => sqlx::query(
                "SELECT worker_id, last_seen, current_job_id FROM worker_heartbeats WHERE worker_id = $1",
            )
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::storage)?
            .map(|row| -> Result<WorkerHeartbeat> {
                Ok(WorkerHeartbeat {
                    worker_id: row.try_get("worker_id").map_err(Error::storage)?,
                    last_seen: row.try_get("last_seen").map_err(Error::storage)?,
                    current_job_id: row.try_get("current_job_id").map_err(Error::storage)?,
                })
            })
            .transpose()?,
            None => None,
        };

        Ok(Some(DetailedJobInfo {
            job,
            result,
            worker,
        }))
    }

    async fn store_result(&self, job_id: Uuid, value: serde_json::Value) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO job_results (key, job_id, result) VALUES ($1, $2, $3)")
            .bind(&key)
            .bind(job_id)
            .bind(&value)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(key)
    }

    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT result FROM job_results WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::storage)?;
        row.map(|r| r.try_get("result").map_err(Error::storage))
            .transpose()
    }

    async fn cleanup_stale_jobs(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;

        // A crashed claim that consumed the final attempt is terminal; a
        // Pending job past its retry budget would never be claimable again.
        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                last_error = 'stale: worker crashed on final attempt',
                worker_id = NULL,
                last_heartbeat = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE status = 'running'
              AND attempts_made >= max_attempts
              AND (last_heartbeat IS NULL OR last_heartbeat < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(self.stale_secs())
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        let released = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                last_heartbeat = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND attempts_made < max_attempts
              AND (last_heartbeat IS NULL OR last_heartbeat < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(self.stale_secs())
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        sqlx::query("DELETE FROM worker_heartbeats WHERE last_seen < NOW() - INTERVAL '1 hour'")
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;

        tx.commit().await.map_err(Error::storage)?;
        Ok(failed.rows_affected() + released.rows_affected())
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::storage)?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(Error::storage)?,
            running: row.try_get("running").map_err(Error::storage)?,
            completed: row.try_get("completed").map_err(Error::storage)?,
            failed: row.try_get("failed").map_err(Error::storage)?,
        })
    }
}

impl PgStore {
    async fn claim(
        &self,
        worker_id: &str,
        available_tasks: &[String],
        limit: i64,
    ) -> Result<Vec<Job>> {
        if available_tasks.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE task_name = ANY($1)
                  AND attempts_made < max_attempts
                  AND (
                        (status = 'pending' AND run_at <= NOW())
                     OR (status = 'running'
                         AND (last_heartbeat IS NULL
                              OR last_heartbeat < NOW() - make_interval(secs => $2)))
                  )
                ORDER BY priority DESC, run_at ASC, created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $4,
                attempts_made = attempts_made + 1,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(available_tasks)
        .bind(self.stale_secs())
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl SchedulerStore for PgStore {
    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_jobs (id, task_name, payload, kind, status, run_at, pattern,
                                        start_date, end_date, last_run_at, next_run_at, priority,
                                        max_attempts, webhook_url, webhook_headers, metadata,
                                        created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW(), NOW())
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.id)
        .bind(&schedule.task_name)
        .bind(&schedule.payload)
        .bind(schedule.kind.as_str())
        .bind(schedule.status.as_str())
        .bind(schedule.run_at)
        .bind(&schedule.pattern)
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.priority)
        .bind(schedule.max_attempts)
        .bind(&schedule.webhook_url)
        .bind(headers_json(&schedule.webhook_headers))
        .bind(&schedule.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::storage)?;

        schedule_from_row(&row)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR task_name = $3)
            ORDER BY created_at, id
            LIMIT $4
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(&filter.task_name)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE scheduled_jobs
            SET payload = $2, status = $3, run_at = $4, pattern = $5, start_date = $6,
                end_date = $7, last_run_at = $8, next_run_at = $9, priority = $10,
                max_attempts = $11, webhook_url = $12, webhook_headers = $13, metadata = $14,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.id)
        .bind(&schedule.payload)
        .bind(schedule.status.as_str())
        .bind(schedule.run_at)
        .bind(&schedule.pattern)
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.priority)
        .bind(schedule.max_attempts)
        .bind(&schedule.webhook_url)
        .bind(headers_json(&schedule.webhook_headers))
        .bind(&schedule.metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)?
        .ok_or(Error::ScheduleNotFound(schedule.id))?;

        schedule_from_row(&row)
    }

    async fn delete_schedules(
        &self,
        status: ScheduleStatus,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduled_jobs WHERE status = $1 AND updated_at < $2",
        )
        .bind(status.as_str())
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(result.rows_affected())
    }

    async fn get_schedules_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs
            WHERE status = 'scheduled'
              AND (
                    (kind = 'one_time' AND run_at <= $1)
                 OR (kind = 'recurring' AND next_run_at <= $1)
              )
            ORDER BY COALESCE(next_run_at, run_at) ASC, id
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(schedule_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_covers_all_tables() {
        for table in ["jobs", "job_results", "worker_heartbeats", "scheduled_jobs"] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "schema is missing {table}"
            );
        }
    }

    #[test]
    fn headers_serialize_to_json_objects() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("authorization".to_string(), "Bearer x".to_string());
        let value = headers_json(&Some(headers)).unwrap();
        assert_eq!(value["authorization"], "Bearer x");
        assert!(headers_json(&None).is_none());
    }

    #[test]
    fn column_lists_stay_in_sync_with_schema() {
        for column in JOB_COLUMNS.split(',').map(str::trim) {
            assert!(SCHEMA.contains(column), "jobs schema is missing {column}");
        }
        for column in SCHEDULE_COLUMNS.split(',').map(str::trim) {
            assert!(
                SCHEMA.contains(column),
                "scheduled_jobs schema is missing {column}"
            );
        }
    }
}
