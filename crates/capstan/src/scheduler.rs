//! The scheduler: promotes due one-time and recurring schedules into queued
//! jobs and computes next-fire times.
//!
//! Materialization goes straight through the storage adapter — the scheduler
//! never executes handlers itself, and the created job's lifecycle is
//! independent of the schedule that produced it. Per-schedule faults during a
//! tick are captured into a bounded error ring and never abort the tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::JobOptions;
use crate::schedule::{
    next_occurrence, parse_pattern, Schedule, ScheduleFilter, ScheduleKind, ScheduleOptions,
    ScheduleStatus, ScheduleUpdate,
};
use crate::store::SchedulerStore;

/// Entries kept in the duration and error rings.
const RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the materialization tick.
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Running,
    Stopped,
}

/// Point-in-time snapshot of scheduler activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub status: SchedulerStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Schedules created through the operation surface.
    pub schedules_created: u64,
    /// Jobs materialized from due schedules.
    pub jobs_materialized: u64,
    /// Durations of the most recent ticks, oldest first.
    pub tick_durations_ms: Vec<u64>,
    /// Most recent per-schedule errors, oldest first.
    pub recent_errors: Vec<String>,
}

#[derive(Default)]
struct MetricsInner {
    last_run_at: Option<DateTime<Utc>>,
    schedules_created: u64,
    jobs_materialized: u64,
    tick_durations_ms: VecDeque<u64>,
    recent_errors: VecDeque<String>,
}

impl MetricsInner {
    fn push_duration(&mut self, ms: u64) {
        if self.tick_durations_ms.len() == RING_CAPACITY {
            self.tick_durations_ms.pop_front();
        }
        self.tick_durations_ms.push_back(ms);
    }

    fn push_error(&mut self, message: String) {
        if self.recent_errors.len() == RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message);
    }
}

/// Materializes due schedules into jobs on a timer.
pub struct Scheduler<S> {
    store: Arc<S>,
    config: SchedulerConfig,
    metrics: Arc<Mutex<MetricsInner>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<S> Scheduler<S> {
    /// Stop the tick loop. Idempotent; safe to call while ticking.
    pub async fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        let task = self.tick_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.running.swap(false, Ordering::SeqCst) {
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let inner = self.metrics.lock().unwrap();
        SchedulerMetrics {
            status: if self.is_running() {
                SchedulerStatus::Running
            } else {
                SchedulerStatus::Stopped
            },
            last_run_at: inner.last_run_at,
            schedules_created: inner.schedules_created,
            jobs_materialized: inner.jobs_materialized,
            tick_durations_ms: inner.tick_durations_ms.iter().copied().collect(),
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }
}

impl<S: SchedulerStore + 'static> Scheduler<S> {
    pub fn new(store: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(Mutex::new(MetricsInner::default())),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            tick_task: Mutex::new(None),
        }
    }

    /// Start the tick loop. The first tick runs immediately so schedules
    /// that came due while the process was down materialize without waiting
    /// a full interval.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = token.clone();

        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let check_interval = self.config.check_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = run_tick(store.as_ref(), &metrics).await {
                            warn!(error = %e, "scheduler tick failed");
                            metrics.lock().unwrap().push_error(format!("tick: {e}"));
                        }
                    }
                }
            }
        });
        *self.tick_task.lock().unwrap() = Some(task);
        info!(interval = ?self.config.check_interval, "scheduler started");
    }

    /// Materialize every schedule due right now; returns how many fired.
    /// Called by the tick loop, and usable directly for manual triggering.
    pub async fn tick(&self) -> Result<u64> {
        run_tick(self.store.as_ref(), &self.metrics).await
    }

    /// Schedule a job to run once at `run_at`. Rejects times in the past.
    pub async fn schedule_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        let now = Utc::now();
        if run_at < now {
            return Err(Error::InvalidSchedule(format!(
                "run_at {run_at} is in the past"
            )));
        }

        // Date bounds only apply to recurring patterns.
        let options = ScheduleOptions {
            start_date: None,
            end_date: None,
            ..options
        };
        let schedule = self
            .store
            .create_schedule(new_schedule(
                task_name,
                payload,
                ScheduleKind::OneTime,
                Some(run_at),
                None,
                None,
                options,
                now,
            ))
            .await?;
        self.metrics.lock().unwrap().schedules_created += 1;
        debug!(schedule_id = %schedule.id, task = %task_name, "one-time schedule created");
        Ok(schedule)
    }

    /// Schedule a job on a standard 5-field Unix cron `pattern`, evaluated
    /// in UTC. The pattern is validated here; invalid patterns never reach
    /// the store.
    pub async fn schedule_recurring_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        pattern: &str,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        if let (Some(start), Some(end)) = (options.start_date, options.end_date) {
            if end < start {
                return Err(Error::InvalidSchedule(format!(
                    "end_date {end} is before start_date {start}"
                )));
            }
        }

        let now = Utc::now();
        let next = next_occurrence(pattern, now, options.start_date, options.end_date)?
            .ok_or_else(|| {
                Error::InvalidSchedule(format!(
                    "pattern {pattern:?} has no occurrence before its end_date"
                ))
            })?;

        let schedule = new_schedule(
            task_name,
            payload,
            ScheduleKind::Recurring,
            None,
            Some(pattern.to_string()),
            Some(next),
            options,
            now,
        );
        let schedule = self.store.create_schedule(schedule).await?;
        self.metrics.lock().unwrap().schedules_created += 1;
        debug!(schedule_id = %schedule.id, task = %task_name, pattern = %pattern, "recurring schedule created");
        Ok(schedule)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        self.store.get_schedule(id).await
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.store.list_schedules(filter).await
    }

    /// Pause a Scheduled entry. `next_run_at` is cleared; resume recomputes
    /// it.
    pub async fn pause(&self, id: Uuid) -> Result<Schedule> {
        let mut schedule = self.require(id).await?;
        if schedule.status != ScheduleStatus::Scheduled {
            return Err(Error::InvalidSchedule(format!(
                "cannot pause a {} schedule",
                schedule.status.as_str()
            )));
        }
        schedule.status = ScheduleStatus::Paused;
        schedule.next_run_at = None;
        self.store.update_schedule(&schedule).await
    }

    /// Resume a Paused entry. Recurring entries get a fresh `next_run_at`
    /// from now; one past its end date completes instead.
    pub async fn resume(&self, id: Uuid) -> Result<Schedule> {
        let mut schedule = self.require(id).await?;
        if schedule.status != ScheduleStatus::Paused {
            return Err(Error::InvalidSchedule(format!(
                "cannot resume a {} schedule",
                schedule.status.as_str()
            )));
        }
        schedule.status = ScheduleStatus::Scheduled;
        if schedule.kind == ScheduleKind::Recurring {
            let pattern = schedule.pattern.clone().ok_or_else(|| {
                Error::InvalidSchedule("recurring schedule without a pattern".into())
            })?;
            match next_occurrence(
                &pattern,
                Utc::now(),
                schedule.start_date,
                schedule.end_date,
            )? {
                Some(next) => schedule.next_run_at = Some(next),
                None => {
                    schedule.status = ScheduleStatus::Completed;
                    schedule.next_run_at = None;
                }
            }
        }
        self.store.update_schedule(&schedule).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Schedule> {
        let mut schedule = self.require(id).await?;
        if matches!(
            schedule.status,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled
        ) {
            return Err(Error::InvalidSchedule(format!(
                "cannot cancel a {} schedule",
                schedule.status.as_str()
            )));
        }
        schedule.status = ScheduleStatus::Cancelled;
        schedule.next_run_at = None;
        self.store.update_schedule(&schedule).await
    }

    /// Apply a partial update. Pattern and date-bound changes re-validate
    /// and recompute the next fire; a one-time `run_at` must not be in the
    /// past.
    pub async fn update(&self, id: Uuid, update: ScheduleUpdate) -> Result<Schedule> {
        let mut schedule = self.require(id).await?;
        if matches!(
            schedule.status,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled
        ) {
            return Err(Error::InvalidSchedule(format!(
                "cannot update a {} schedule",
                schedule.status.as_str()
            )));
        }

        if let Some(payload) = update.payload {
            schedule.payload = payload;
        }
        if let Some(priority) = update.priority {
            schedule.priority = priority;
        }
        if let Some(max_attempts) = update.max_attempts {
            schedule.max_attempts = max_attempts.max(1);
        }
        if let Some(url) = update.webhook_url {
            schedule.webhook_url = Some(url);
        }
        if let Some(headers) = update.webhook_headers {
            schedule.webhook_headers = Some(headers);
        }
        if let Some(metadata) = update.metadata {
            schedule.metadata = Some(metadata);
        }

        match schedule.kind {
            ScheduleKind::OneTime => {
                if update.pattern.is_some() {
                    return Err(Error::InvalidSchedule(
                        "one-time schedules have no cron pattern".into(),
                    ));
                }
                if let Some(run_at) = update.run_at {
                    if run_at < Utc::now() {
                        return Err(Error::InvalidSchedule(format!(
                            "run_at {run_at} is in the past"
                        )));
                    }
                    schedule.run_at = Some(run_at);
                }
            }
            ScheduleKind::Recurring => {
                if update.run_at.is_some() {
                    return Err(Error::InvalidSchedule(
                        "recurring schedules have no run_at".into(),
                    ));
                }
                let mut recompute = false;
                if let Some(pattern) = update.pattern {
                    parse_pattern(&pattern)?;
                    schedule.pattern = Some(pattern);
                    recompute = true;
                }
                if update.start_date.is_some() {
                    schedule.start_date = update.start_date;
                    recompute = true;
                }
                if update.end_date.is_some() {
                    schedule.end_date = update.end_date;
                    recompute = true;
                }
                if let (Some(start), Some(end)) = (schedule.start_date, schedule.end_date) {
                    if end < start {
                        return Err(Error::InvalidSchedule(format!(
                            "end_date {end} is before start_date {start}"
                        )));
                    }
                }
                if recompute && schedule.status == ScheduleStatus::Scheduled {
                    let pattern = schedule.pattern.clone().ok_or_else(|| {
                        Error::InvalidSchedule("recurring schedule without a pattern".into())
                    })?;
                    let next = next_occurrence(
                        &pattern,
                        Utc::now(),
                        schedule.start_date,
                        schedule.end_date,
                    )?
                    .ok_or_else(|| {
                        Error::InvalidSchedule(format!(
                            "pattern {pattern:?} has no occurrence before its end_date"
                        ))
                    })?;
                    schedule.next_run_at = Some(next);
                }
            }
        }

        self.store.update_schedule(&schedule).await
    }

    /// Bring overdue Scheduled entries back in line: one-time entries with a
    /// past `run_at` are moved to fire now; recurring entries with a past
    /// `next_run_at` advance to their next occurrence or complete.
    pub async fn reschedule_overdue(&self) -> Result<u64> {
        let now = Utc::now();
        let filter = ScheduleFilter {
            status: Some(ScheduleStatus::Scheduled),
            ..Default::default()
        };

        let mut changed = 0;
        for mut schedule in self.store.list_schedules(&filter).await? {
            match schedule.kind {
                ScheduleKind::OneTime => {
                    if schedule.run_at.map_or(false, |t| t < now) {
                        schedule.run_at = Some(now);
                        self.store.update_schedule(&schedule).await?;
                        changed += 1;
                    }
                }
                ScheduleKind::Recurring => {
                    if schedule.next_run_at.map_or(false, |t| t < now) {
                        let pattern = match schedule.pattern.clone() {
                            Some(p) => p,
                            None => continue,
                        };
                        match next_occurrence(
                            &pattern,
                            now,
                            schedule.start_date,
                            schedule.end_date,
                        )? {
                            Some(next) => schedule.next_run_at = Some(next),
                            None => {
                                schedule.status = ScheduleStatus::Completed;
                                schedule.next_run_at = None;
                            }
                        }
                        self.store.update_schedule(&schedule).await?;
                        changed += 1;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Delete Completed schedules last touched before `before`.
    pub async fn cleanup_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        self.store
            .delete_schedules(ScheduleStatus::Completed, before)
            .await
    }

    async fn require(&self, id: Uuid) -> Result<Schedule> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or(Error::ScheduleNotFound(id))
    }
}

/// One materialization pass over everything due, shared by the tick loop
/// and [`Scheduler::tick`].
async fn run_tick<S: SchedulerStore>(store: &S, metrics: &Mutex<MetricsInner>) -> Result<u64> {
    let started = std::time::Instant::now();
    let now = Utc::now();
    let due = store.get_schedules_to_run(now).await?;

    let mut fired = 0;
    for schedule in due {
        let id = schedule.id;
        match fire_schedule(store, schedule, now).await {
            Ok(()) => fired += 1,
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "failed to materialize schedule");
                metrics.lock().unwrap().push_error(format!("{id}: {e}"));
            }
        }
    }

    let mut inner = metrics.lock().unwrap();
    inner.last_run_at = Some(now);
    inner.jobs_materialized += fired;
    inner.push_duration(started.elapsed().as_millis() as u64);
    Ok(fired)
}

/// Create the job for a due schedule and advance (or complete) it.
///
/// The advance is computed before the job is created: a schedule whose
/// pattern cannot be evaluated must not materialize anything, or it would
/// fire again on every tick.
async fn fire_schedule<S: SchedulerStore>(
    store: &S,
    mut schedule: Schedule,
    now: DateTime<Utc>,
) -> Result<()> {
    let advance = match schedule.kind {
        ScheduleKind::OneTime => None,
        ScheduleKind::Recurring => {
            let pattern = schedule.pattern.as_deref().ok_or_else(|| {
                Error::InvalidSchedule("recurring schedule without a pattern".into())
            })?;
            next_occurrence(pattern, now, schedule.start_date, schedule.end_date)?
        }
    };

    let options = JobOptions {
        priority: schedule.priority,
        run_at: None,
        max_attempts: schedule.max_attempts,
        webhook_url: schedule.webhook_url.clone(),
        webhook_headers: schedule.webhook_headers.clone(),
    };
    let job = store
        .create_job(&schedule.task_name, schedule.payload.clone(), &options)
        .await?;
    debug!(schedule_id = %schedule.id, job_id = %job.id, task = %schedule.task_name, "schedule fired");

    schedule.last_run_at = Some(now);
    match (schedule.kind, advance) {
        (ScheduleKind::Recurring, Some(next)) => schedule.next_run_at = Some(next),
        _ => {
            schedule.status = ScheduleStatus::Completed;
            schedule.next_run_at = None;
        }
    }
    store.update_schedule(&schedule).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn new_schedule(
    task_name: &str,
    payload: serde_json::Value,
    kind: ScheduleKind,
    run_at: Option<DateTime<Utc>>,
    pattern: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    options: ScheduleOptions,
    now: DateTime<Utc>,
) -> Schedule {
    Schedule {
        id: Uuid::new_v4(),
        task_name: task_name.to_string(),
        payload,
        kind,
        status: ScheduleStatus::Scheduled,
        run_at,
        pattern,
        start_date: options.start_date,
        end_date: options.end_date,
        last_run_at: None,
        next_run_at,
        priority: options.priority,
        max_attempts: options.max_attempts.unwrap_or(3).max(1),
        webhook_url: options.webhook_url,
        webhook_headers: options.webhook_headers,
        metadata: options.metadata,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_one_minute() {
        assert_eq!(
            SchedulerConfig::default().check_interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn rings_are_bounded() {
        let mut inner = MetricsInner::default();
        for i in 0..250 {
            inner.push_duration(i);
            inner.push_error(format!("err {i}"));
        }
        assert_eq!(inner.tick_durations_ms.len(), RING_CAPACITY);
        assert_eq!(inner.recent_errors.len(), RING_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(inner.tick_durations_ms.front().copied(), Some(150));
        assert_eq!(inner.recent_errors.front().cloned(), Some("err 150".into()));
    }
}
