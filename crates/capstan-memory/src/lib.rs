//! In-memory implementation of the capstan storage contract.
//!
//! A single async mutex over the whole state gives every operation the
//! atomicity the contract demands — a claim observes and mutates the job
//! table in one critical section, so no job is ever handed to two workers.
//!
//! This store backs the test suites and the Local profile; it is also the
//! reference implementation to read alongside the contract docs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use capstan::{
    DetailedJobInfo, Error, Job, JobFilter, JobOptions, JobStatus, QueueStats, RemoveOptions,
    Result, Schedule, ScheduleFilter, ScheduleKind, ScheduleStatus, SchedulerStore,
    StorageAdapter, WorkerHeartbeat, DEFAULT_STALE_THRESHOLD,
};

struct StoredResult {
    job_id: Uuid,
    value: serde_json::Value,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    results: HashMap<String, StoredResult>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    schedules: HashMap<Uuid, Schedule>,
}

/// In-memory storage adapter.
pub struct MemoryStore {
    state: Mutex<State>,
    stale_threshold: Duration,
    connected: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_stale_threshold(DEFAULT_STALE_THRESHOLD)
    }

    /// Override how long a Running job may go without a heartbeat before it
    /// counts as abandoned. Tests use short thresholds.
    pub fn with_stale_threshold(threshold: StdDuration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            stale_threshold: Duration::from_std(threshold)
                .unwrap_or_else(|_| Duration::seconds(300)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.stale_threshold
    }
}

/// Whether `job` may be claimed right now: ready Pending work, or a Running
/// job whose owner stopped heartbeating. Either way the retry budget must
/// not be exhausted, so `attempts_made` never exceeds `max_attempts`.
fn claimable(job: &Job, tasks: &[String], now: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    if !tasks.iter().any(|t| t == &job.task_name) {
        return false;
    }
    if job.attempts_made >= job.max_attempts {
        return false;
    }
    match job.status {
        JobStatus::Pending => job.run_at <= now,
        JobStatus::Running => job.last_heartbeat.map_or(true, |hb| hb < cutoff),
        _ => false,
    }
}

/// Claim order: priority high to low, then earliest `run_at`, then earliest
/// `created_at`, ties broken by id.
fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.run_at.cmp(&b.run_at))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

fn claim(job: &mut Job, worker_id: &str, now: DateTime<Utc>) {
    job.status = JobStatus::Running;
    job.worker_id = Some(worker_id.to_string());
    job.attempts_made += 1;
    job.last_heartbeat = Some(now);
    job.updated_at = now;
}

impl State {
    fn claim_next(
        &mut self,
        worker_id: &str,
        tasks: &[String],
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Option<Job> {
        let mut best: Option<Uuid> = None;
        for job in self.jobs.values() {
            if !claimable(job, tasks, now, cutoff) {
                continue;
            }
            match best {
                Some(id) => {
                    if claim_order(job, &self.jobs[&id]) == std::cmp::Ordering::Less {
                        best = Some(job.id);
                    }
                }
                None => best = Some(job.id),
            }
        }

        let id = best?;
        let job = self.jobs.get_mut(&id)?;
        claim(job, worker_id, now);
        Some(job.clone())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            task_name: task_name.to_string(),
            payload,
            status: JobStatus::Pending,
            priority: options.priority,
            run_at: options.run_at.unwrap_or(now),
            attempts_made: 0,
            max_attempts: options.max_attempts.max(1),
            last_error: None,
            progress: 0,
            worker_id: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result_key: None,
            webhook_url: options.webhook_url.clone(),
            webhook_headers: options.webhook_headers.clone(),
        };

        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn fetch_next_job(
        &self,
        worker_id: &str,
        available_tasks: &[String],
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let cutoff = self.stale_cutoff(now);
        let mut state = self.state.lock().await;
        Ok(state.claim_next(worker_id, available_tasks, now, cutoff))
    }

    async fn fetch_next_batch(
        &self,
        worker_id: &str,
        available_tasks: &[String],
        batch_size: i64,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let cutoff = self.stale_cutoff(now);
        let mut state = self.state.lock().await;

        let mut claimed = Vec::new();
        while (claimed.len() as i64) < batch_size {
            match state.claim_next(worker_id, available_tasks, now, cutoff) {
                Some(job) => claimed.push(job),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid, result_key: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status.is_terminal() {
                return Ok(());
            }
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.result_key = result_key.map(|k| k.to_string());
            job.worker_id = None;
            job.completed_at = Some(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        job.last_error = Some(error.to_string());
        job.worker_id = None;
        job.last_heartbeat = None;
        job.updated_at = now;

        if job.has_attempts_remaining() {
            job.status = JobStatus::Pending;
            job.run_at = now + Duration::seconds(job.backoff_seconds());
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status.is_terminal() {
                return Ok(());
            }
            let now = Utc::now();
            job.status = status;
            if let Some(error) = error {
                job.last_error = Some(error.to_string());
            }
            if status != JobStatus::Running {
                job.worker_id = None;
            }
            if status.is_terminal() {
                job.completed_at = Some(now);
            }
            job.updated_at = now;
        }
        Ok(())
    }

    async fn update_job_progress(&self, job_id: Uuid, progress: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                let clamped = progress.clamp(0, 100);
                if clamped > job.progress {
                    job.progress = clamped;
                    job.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn update_jobs_batch(
        &self,
        job_ids: &[Uuid],
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut changed = 0;
        for job_id in job_ids {
            if let Some(job) = state.jobs.get_mut(job_id) {
                if job.status.is_terminal() {
                    continue;
                }
                job.status = status;
                if let Some(error) = error {
                    job.last_error = Some(error.to_string());
                }
                if status != JobStatus::Running {
                    job.worker_id = None;
                }
                if status.is_terminal() {
                    job.completed_at = Some(now);
                }
                job.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Option<Uuid>) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.heartbeats.insert(
            worker_id.to_string(),
            WorkerHeartbeat {
                worker_id: worker_id.to_string(),
                last_seen: now,
                current_job_id: job_id,
            },
        );

        if let Some(job_id) = job_id {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                if job.status == JobStatus::Running
                    && job.worker_id.as_deref() == Some(worker_id)
                {
                    job.last_heartbeat = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                filter.status.map_or(true, |s| job.status == s)
                    && filter
                        .task_name
                        .as_deref()
                        .map_or(true, |t| job.task_name == t)
                    && filter
                        .worker_id
                        .as_deref()
                        .map_or(true, |w| job.worker_id.as_deref() == Some(w))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        jobs.truncate(filter.limit.unwrap_or(100).max(0) as usize);
        Ok(jobs)
    }

    async fn remove_jobs_by_status(&self, status: JobStatus, opts: RemoveOptions) -> Result<u64> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == status
                    && opts.older_than.map_or(true, |t| job.updated_at < t)
            })
            .map(|job| job.id)
            .collect();

        for id in &doomed {
            state.jobs.remove(id);
        }
        if opts.purge_results {
            let removed: std::collections::HashSet<Uuid> = doomed.iter().copied().collect();
            state.results.retain(|_, result| !removed.contains(&result.job_id));
        }
        Ok(doomed.len() as u64)
    }

    async fn get_detailed_job_info(&self, job_id: Uuid) -> Result<Option<DetailedJobInfo>> {
        let state = self.state.lock().await;
        let Some(job) = state.jobs.get(&job_id).cloned() else {
            return Ok(None);
        };
        let result = job
            .result_key
            .as_deref()
            .and_then(|key| state.results.get(key))
            .map(|stored| stored.value.clone());
        let worker = job
            .worker_id
            .as_deref()
            .and_then(|worker_id| state.heartbeats.get(worker_id))
            .cloned();
        Ok(Some(DetailedJobInfo {
            job,
            result,
            worker,
        }))
    }

    async fn store_result(&self, job_id: Uuid, value: serde_json::Value) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        self.state
            .lock()
            .await
            .results
            .insert(key.clone(), StoredResult { job_id, value });
        Ok(key)
    }

    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .state
            .lock()
            .await
            .results
            .get(key)
            .map(|stored| stored.value.clone()))
    }

    async fn cleanup_stale_jobs(&self) -> Result<u64> {
        let now = Utc::now();
        let cutoff = self.stale_cutoff(now);
        let mut state = self.state.lock().await;

        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.last_heartbeat.map_or(true, |hb| hb < cutoff)
            {
                job.worker_id = None;
                job.last_heartbeat = None;
                job.updated_at = now;
                if job.has_attempts_remaining() {
                    job.status = JobStatus::Pending;
                } else {
                    // The crashed claim consumed the final attempt; a
                    // Pending job past its retry budget would never be
                    // claimable again.
                    job.status = JobStatus::Failed;
                    job.last_error =
                        Some("stale: worker crashed on final attempt".to_string());
                    job.completed_at = Some(now);
                }
                released += 1;
            }
        }

        // Worker rows unseen for an hour belong to dead processes.
        let retention_cutoff = now - Duration::hours(1);
        state
            .heartbeats
            .retain(|_, hb| hb.last_seen >= retention_cutoff);

        Ok(released)
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        self.state
            .lock()
            .await
            .schedules
            .insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.state.lock().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let state = self.state.lock().await;
        let mut schedules: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| {
                filter.status.map_or(true, |status| s.status == status)
                    && filter.kind.map_or(true, |kind| s.kind == kind)
                    && filter
                        .task_name
                        .as_deref()
                        .map_or(true, |t| s.task_name == t)
            })
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        schedules.truncate(filter.limit.unwrap_or(100).max(0) as usize);
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let mut state = self.state.lock().await;
        if !state.schedules.contains_key(&schedule.id) {
            return Err(Error::ScheduleNotFound(schedule.id));
        }
        let mut updated = schedule.clone();
        updated.updated_at = Utc::now();
        state.schedules.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_schedules(
        &self,
        status: ScheduleStatus,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .schedules
            .values()
            .filter(|s| s.status == status && s.updated_at < before)
            .map(|s| s.id)
            .collect();
        for id in &doomed {
            state.schedules.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn get_schedules_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let state = self.state.lock().await;
        let mut due: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Scheduled
                    && match s.kind {
                        ScheduleKind::OneTime => s.run_at.map_or(false, |t| t <= now),
                        ScheduleKind::Recurring => s.next_run_at.map_or(false, |t| t <= now),
                    }
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| match s.kind {
            ScheduleKind::OneTime => s.run_at,
            ScheduleKind::Recurring => s.next_run_at,
        });
        Ok(due)
    }
}
