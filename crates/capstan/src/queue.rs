//! The queue: handler registry, job admission, execution and shutdown.
//!
//! ```text
//! add_job ──► store (Pending) ──► Worker claim ──► process_job
//!                                                     │
//!                      handler ok ── store_result ────┤
//!                      handler err ── retry or fail ──┤
//!                      cancelled  ── killer recorded ─┘
//!                                                     ▼
//!                                                  events
//! ```
//!
//! The registry and active-job set are process-local; all cross-process
//! contention resolves through the storage adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventHub, JobEvent, NoopWebhookSink, WebhookSink};
use crate::handler::{JobContext, TaskHandler};
use crate::job::{DetailedJobInfo, Job, JobFilter, JobOptions, JobStatus, QueueStats};
use crate::schedule::{
    Schedule, ScheduleFilter, ScheduleOptions, ScheduleUpdate,
};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerMetrics};
use crate::store::{RemoveOptions, SchedulerStore, StorageAdapter};

/// Options for [`Queue::shutdown`].
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOptions {
    /// How long to wait for running jobs to drain.
    pub timeout: Duration,
    /// Kill whatever remains after the drain timeout instead of failing.
    pub force: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            force: false,
        }
    }
}

/// A durable job queue over a storage adapter.
///
/// Holds the process-local task registry and event listeners; everything
/// durable lives behind the adapter. Construct one per process (or per test)
/// — there is no global state.
pub struct Queue<S> {
    store: Arc<S>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    active: DashMap<Uuid, CancellationToken>,
    events: Arc<EventHub>,
    webhook: Arc<dyn WebhookSink>,
    shutting_down: AtomicBool,
    shutdown_outcome: OnceCell<std::result::Result<(), (Duration, usize)>>,
    scheduler: OnceLock<Arc<Scheduler<S>>>,
}

impl<S: StorageAdapter + 'static> Queue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            handlers: DashMap::new(),
            active: DashMap::new(),
            events: Arc::new(EventHub::new()),
            webhook: Arc::new(NoopWebhookSink),
            shutting_down: AtomicBool::new(false),
            shutdown_outcome: OnceCell::new(),
            scheduler: OnceLock::new(),
        }
    }

    /// Replace the webhook sink invoked for jobs carrying a `webhook_url`.
    pub fn with_webhook_sink(mut self, sink: impl WebhookSink + 'static) -> Self {
        self.webhook = Arc::new(sink);
        self
    }

    /// Connect the storage adapter.
    pub async fn init(&self) -> Result<()> {
        self.store.connect().await
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Register a handler under `name`. Replacing an existing handler is
    /// allowed but logged, since it usually indicates duplicated wiring.
    pub fn register_task(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(task = %name, "replaced an already-registered task handler");
        }
    }

    /// The task names this process can execute. Passed into every claim so
    /// workers only pull jobs they can run.
    pub fn registered_task_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Ids of jobs currently executing in this process.
    pub fn active_job_ids(&self) -> Vec<Uuid> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Admit a new job. Rejects unknown task names and refuses admissions
    /// during shutdown.
    pub async fn add_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        if !self.handlers.contains_key(task_name) {
            return Err(Error::UnknownTask(task_name.to_string()));
        }

        let job = self.store.create_job(task_name, payload, &options).await?;
        debug!(job_id = %job.id, task = %task_name, "job admitted");
        self.events.emit(&JobEvent::Created { job: job.clone() });
        Ok(job)
    }

    pub async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get_job_by_id(job_id).await
    }

    pub async fn get_job_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.store.get_result(key).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    pub async fn get_detailed_job_info(&self, job_id: Uuid) -> Result<Option<DetailedJobInfo>> {
        self.store.get_detailed_job_info(job_id).await
    }

    pub async fn remove_jobs_by_status(
        &self,
        status: JobStatus,
        opts: RemoveOptions,
    ) -> Result<u64> {
        self.store.remove_jobs_by_status(status, opts).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        self.store.get_queue_stats().await
    }

    /// Execute a claimed job by dispatching to its registered handler.
    ///
    /// The claim already transitioned the job to Running under `worker_id`;
    /// this records liveness, runs the handler with a fresh cancellation
    /// token, and writes the terminal outcome. A cancellation sentinel from
    /// the handler is swallowed — the killer already recorded the failure.
    pub async fn process_job(&self, worker_id: &str, job: &Job) -> Result<()> {
        let token = CancellationToken::new();
        self.active.insert(job.id, token.clone());

        if let Err(e) = self.store.heartbeat(worker_id, Some(job.id)).await {
            warn!(job_id = %job.id, error = %e, "heartbeat upsert failed");
        }

        let handler = self
            .handlers
            .get(&job.task_name)
            .map(|entry| Arc::clone(entry.value()));

        let outcome = match handler {
            Some(handler) => {
                let ctx = JobContext::new(
                    job,
                    self.store.clone() as Arc<dyn StorageAdapter>,
                    self.events.clone(),
                    self.webhook.clone(),
                    token,
                );
                match handler.run(job.payload.clone(), ctx.clone()).await {
                    Ok(value) => self.finish_success(job, &ctx, value).await,
                    Err(Error::Cancelled) => {
                        debug!(job_id = %job.id, "handler observed cancellation");
                        Ok(())
                    }
                    Err(err) => self.finish_failure(job, &err.to_string()).await,
                }
            }
            // Claims filter on the registry, so this only happens when the
            // registry changed between claim and dispatch.
            None => {
                self.finish_failure(job, &format!("no handler registered for task: {}", job.task_name))
                    .await
            }
        };

        self.active.remove(&job.id);
        outcome
    }

    async fn finish_success(
        &self,
        job: &Job,
        ctx: &JobContext,
        value: serde_json::Value,
    ) -> Result<()> {
        let result_key = match ctx.take_stored_key() {
            Some(key) => key,
            None => self.store.store_result(job.id, value).await?,
        };
        self.store.complete_job(job.id, Some(&result_key)).await?;

        debug!(job_id = %job.id, task = %job.task_name, "job completed");
        let event = JobEvent::Completed {
            job_id: job.id,
            task_name: job.task_name.clone(),
            result_key,
        };
        self.events.emit(&event);
        self.deliver_webhook(job, &event).await;
        Ok(())
    }

    async fn finish_failure(&self, job: &Job, message: &str) -> Result<()> {
        self.store.fail_job(job.id, message).await?;

        let will_retry = job.has_attempts_remaining();
        warn!(job_id = %job.id, task = %job.task_name, error = %message, will_retry, "job failed");
        let event = JobEvent::Failed {
            job_id: job.id,
            task_name: job.task_name.clone(),
            error: message.to_string(),
            will_retry,
        };
        self.events.emit(&event);
        self.deliver_webhook(job, &event).await;
        Ok(())
    }

    async fn deliver_webhook(&self, job: &Job, event: &JobEvent) {
        if job.webhook_url.is_some() {
            self.webhook.deliver(job, event).await;
        }
    }

    /// Kill a Running job: record the terminal failure, trip its
    /// cancellation token, and wait up to `timeout` for the handler to let
    /// go. Races with normal completion are benign — the first terminal
    /// write wins.
    pub async fn kill_job(&self, job_id: Uuid, reason: &str, timeout: Duration) -> Result<()> {
        let job = self
            .store
            .get_job_by_id(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(Error::NotRunning {
                id: job_id,
                status: job.status.as_str(),
            });
        }

        self.store
            .update_job_status(job_id, JobStatus::Failed, Some(reason))
            .await?;

        if let Some(token) = self.active.get(&job_id).map(|entry| entry.value().clone()) {
            token.cancel();
        }

        info!(job_id = %job_id, reason = %reason, "job killed");
        let event = JobEvent::Failed {
            job_id,
            task_name: job.task_name.clone(),
            error: reason.to_string(),
            will_retry: false,
        };
        self.events.emit(&event);
        self.deliver_webhook(&job, &event).await;

        let deadline = tokio::time::Instant::now() + timeout;
        while self.active.contains_key(&job_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.active.remove(&job_id).is_some() {
            warn!(job_id = %job_id, "killed job did not release within timeout");
        }
        Ok(())
    }

    /// Kill several jobs; returns how many were actually killed. Jobs that
    /// are not Running are skipped with a log line rather than failing the
    /// whole batch.
    pub async fn kill_jobs(
        &self,
        job_ids: &[Uuid],
        reason: &str,
        timeout: Duration,
    ) -> Result<u64> {
        let mut killed = 0;
        for &job_id in job_ids {
            match self.kill_job(job_id, reason, timeout).await {
                Ok(()) => killed += 1,
                Err(Error::NotRunning { id, status }) => {
                    debug!(job_id = %id, status, "skipping kill of non-running job");
                }
                Err(Error::JobNotFound(id)) => {
                    debug!(job_id = %id, "skipping kill of unknown job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(killed)
    }

    /// Drain and stop the queue. Single-flight: concurrent calls share one
    /// shutdown and observe the same outcome.
    ///
    /// The registry is cleared first so no new jobs are admitted or claimed;
    /// then running jobs get `timeout` to drain (polled every 500 ms). On
    /// timeout, `force` decides between killing the stragglers and raising
    /// [`Error::ShutdownTimeout`]. The scheduler is stopped and the store
    /// disconnected (with its own bounded timeout) on the way out.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> Result<()> {
        let outcome = self
            .shutdown_outcome
            .get_or_init(|| async move { self.shutdown_inner(opts).await })
            .await;
        outcome
            .clone()
            .map_err(|(timeout, remaining)| Error::ShutdownTimeout { timeout, remaining })
    }

    async fn shutdown_inner(
        &self,
        opts: ShutdownOptions,
    ) -> std::result::Result<(), (Duration, usize)> {
        info!(timeout = ?opts.timeout, force = opts.force, "queue shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.handlers.clear();

        let deadline = tokio::time::Instant::now() + opts.timeout;
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let remaining: Vec<Uuid> = self.active_job_ids();
        if !remaining.is_empty() {
            if !opts.force {
                warn!(count = remaining.len(), "drain timed out");
                return Err((opts.timeout, remaining.len()));
            }
            warn!(count = remaining.len(), "drain timed out, killing remaining jobs");
            for job_id in remaining {
                if let Err(e) = self
                    .kill_job(job_id, "Forced shutdown", Duration::from_secs(5))
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "kill during forced shutdown failed");
                }
            }
        }

        if let Some(scheduler) = self.scheduler.get() {
            scheduler.stop().await;
        }

        match tokio::time::timeout(Duration::from_secs(10), self.store.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "storage disconnect failed"),
            Err(_) => warn!("storage disconnect timed out"),
        }

        info!("queue shutdown complete");
        Ok(())
    }

    // Event subscriptions. Listeners run synchronously with the transition
    // that caused the event; panics are contained.

    pub fn on_job_created(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.events.on_created(listener);
    }

    pub fn on_job_progress(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.events.on_progress(listener);
    }

    pub fn on_job_completed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.events.on_completed(listener);
    }

    pub fn on_job_failed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.events.on_failed(listener);
    }
}

/// Scheduling surface, available when the adapter persists schedules.
///
/// The scheduler is constructed lazily on first use; [`Queue::start_scheduler`]
/// additionally starts its tick loop so due schedules materialize into jobs.
impl<S: SchedulerStore + 'static> Queue<S> {
    fn scheduler_handle(&self) -> &Arc<Scheduler<S>> {
        self.scheduler
            .get_or_init(|| Arc::new(Scheduler::new(self.store.clone(), SchedulerConfig::default())))
    }

    /// Construct the scheduler with `config` and start its tick loop.
    pub fn start_scheduler(&self, config: SchedulerConfig) {
        self.scheduler
            .get_or_init(|| Arc::new(Scheduler::new(self.store.clone(), config)))
            .start();
    }

    pub async fn schedule_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        run_at: chrono::DateTime<chrono::Utc>,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        self.scheduler_handle()
            .schedule_job(task_name, payload, run_at, options)
            .await
    }

    pub async fn schedule_recurring_job(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        pattern: &str,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        self.scheduler_handle()
            .schedule_recurring_job(task_name, payload, pattern, options)
            .await
    }

    pub async fn pause_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.scheduler_handle().pause(id).await
    }

    pub async fn resume_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.scheduler_handle().resume(id).await
    }

    pub async fn cancel_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.scheduler_handle().cancel(id).await
    }

    pub async fn update_schedule(&self, id: Uuid, update: ScheduleUpdate) -> Result<Schedule> {
        self.scheduler_handle().update(id, update).await
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        self.scheduler_handle().get(id).await
    }

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.scheduler_handle().list(filter).await
    }

    /// Bring overdue schedules back in line: past-due one-time entries fire
    /// immediately, past-due recurring entries advance to their next
    /// occurrence (or complete).
    pub async fn reschedule_overdue(&self) -> Result<u64> {
        self.scheduler_handle().reschedule_overdue().await
    }

    pub async fn cleanup_completed_schedules(
        &self,
        before: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        self.scheduler_handle().cleanup_completed(before).await
    }

    pub fn scheduler_metrics(&self) -> SchedulerMetrics {
        self.scheduler_handle().metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_options_default_to_thirty_second_drain() {
        let opts = ShutdownOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert!(!opts.force);
    }
}
