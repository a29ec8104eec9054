//! Worker: one logical executor that polls, claims, runs, heartbeats and
//! drains on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::Job;
use crate::queue::Queue;
use crate::store::StorageAdapter;

/// Worker configuration. The two named profiles match the supported
/// deployment environments.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no job was ready.
    pub poll_interval: Duration,
    /// Wall-clock budget per run for hosts with execution limits (e.g.
    /// serverless). `None` means continuous polling.
    pub max_execution_time: Option<Duration>,
    /// Claim size in batch mode.
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl WorkerConfig {
    /// Long-lived process: continuous polling, unbounded execution time.
    pub fn local() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_execution_time: None,
            batch_size: 5,
        }
    }

    /// Wall-clock-limited host: batch claims, budget safely under a 30 s
    /// platform limit.
    pub fn constrained() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_execution_time: Some(Duration::from_secs(25)),
            batch_size: 5,
        }
    }

    /// Heartbeat cadence: twice the poll interval, capped at 30 s.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.poll_interval * 2).min(Duration::from_secs(30))
    }
}

/// State shared between the worker handle and its spawned loops.
struct WorkerCore<S> {
    id: String,
    queue: Arc<Queue<S>>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    draining: AtomicBool,
    current_job: Mutex<Option<Uuid>>,
}

/// A single job executor with its own identity and heartbeat.
///
/// Continuous mode polls and claims one job at a time; batch mode
/// ([`Worker::process_next_batch`]) claims up to `batch_size` jobs per round
/// under a wall-clock budget. Either way the heartbeat runs on an
/// independent timer, and heartbeat faults are logged and swallowed — the
/// stale sweep is the safety net.
pub struct Worker<S> {
    core: Arc<WorkerCore<S>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl<S: StorageAdapter + 'static> Worker<S> {
    pub fn new(queue: Arc<Queue<S>>, config: WorkerConfig) -> Self {
        Self {
            core: Arc::new(WorkerCore {
                id: format!("worker-{}", Uuid::new_v4()),
                queue,
                config,
                shutdown: CancellationToken::new(),
                draining: AtomicBool::new(false),
                current_job: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn current_job_id(&self) -> Option<Uuid> {
        self.core.current_job_id()
    }

    /// Spawn the polling loop and the heartbeat timer. A worker starts at
    /// most once; restart by constructing a new worker.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(worker_id = %self.core.id, "worker starting");

        let heartbeat = {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move { core.heartbeat_loop().await })
        };
        let main = {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move {
                match core.config.max_execution_time {
                    None => core.run_continuous().await,
                    Some(budget) => {
                        if let Err(e) = core.process_next_batch(usize::MAX, budget).await {
                            error!(worker_id = %core.id, error = %e, "batch run failed");
                        }
                        // Budget exhausted; stop the heartbeat alongside.
                        core.shutdown.cancel();
                    }
                }
                info!(worker_id = %core.id, "worker stopped");
            })
        };
        self.tasks.lock().unwrap().extend([heartbeat, main]);
    }

    /// Batch mode entry point: claim and process jobs until `max_jobs` is
    /// reached, the budget elapses, or the queue runs dry. An empty batch
    /// falls back to one single-job fetch before giving up, so a job
    /// admitted mid-round still gets picked up.
    pub async fn process_next_batch(&self, max_jobs: usize, budget: Duration) -> Result<usize> {
        self.core.process_next_batch(max_jobs, budget).await
    }

    /// Hard stop: cancel the loops and wait for them to exit. The job in
    /// flight (if any) keeps running on the queue's executor path until its
    /// own cancellation or completion.
    pub async fn stop(&self) {
        self.core.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Drain, then stop. Returns whether the drain was clean: `true` when no
    /// job was in flight or the in-flight job finished within `timeout`.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        if self.core.current_job_id().is_none() {
            self.stop().await;
            return true;
        }

        self.core.draining.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        while self.core.current_job_id().is_some() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let clean = self.core.current_job_id().is_none();
        if !clean {
            warn!(worker_id = %self.core.id, "graceful shutdown timed out with a job in flight");
        }
        self.stop().await;
        clean
    }
}

impl<S: StorageAdapter + 'static> WorkerCore<S> {
    fn current_job_id(&self) -> Option<Uuid> {
        *self.current_job.lock().unwrap()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    async fn run_continuous(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Best-effort sweep; the claim filter covers us if it faults.
            if let Err(e) = self.queue.store().cleanup_stale_jobs().await {
                debug!(worker_id = %self.id, error = %e, "stale sweep failed");
            }

            let tasks = self.queue.registered_task_names();
            if tasks.is_empty() {
                if self.queue.is_shutting_down() {
                    break;
                }
                self.idle_wait().await;
                continue;
            }

            match self.queue.store().fetch_next_job(&self.id, &tasks).await {
                Ok(Some(job)) => {
                    self.run_one(job).await;
                    if self.is_draining() {
                        break;
                    }
                }
                Ok(None) => {
                    self.idle_wait().await;
                    if self.is_draining() {
                        break;
                    }
                }
                Err(e) => {
                    // Transient storage fault: log, sleep a poll, continue.
                    error!(worker_id = %self.id, error = %e, "failed to claim a job");
                    self.idle_wait().await;
                }
            }
        }
    }

    async fn process_next_batch(&self, max_jobs: usize, budget: Duration) -> Result<usize> {
        let started = tokio::time::Instant::now();

        if let Err(e) = self.queue.store().cleanup_stale_jobs().await {
            debug!(worker_id = %self.id, error = %e, "stale sweep failed");
        }

        let mut processed = 0;
        while processed < max_jobs
            && started.elapsed() < budget
            && !self.shutdown.is_cancelled()
        {
            let tasks = self.queue.registered_task_names();
            if tasks.is_empty() {
                break;
            }

            let want = (max_jobs - processed).min(self.config.batch_size as usize) as i64;
            let batch = self
                .queue
                .store()
                .fetch_next_batch(&self.id, &tasks, want)
                .await?;

            if batch.is_empty() {
                match self.queue.store().fetch_next_job(&self.id, &tasks).await? {
                    Some(job) => {
                        self.run_one(job).await;
                        processed += 1;
                    }
                    None => break,
                }
                continue;
            }

            // Claimed jobs run to completion even if the budget lapses
            // mid-batch; abandoning them would leave Running rows for the
            // stale sweep to mop up.
            for job in batch {
                self.run_one(job).await;
                processed += 1;
            }
        }

        debug!(worker_id = %self.id, processed, "batch run finished");
        Ok(processed)
    }

    async fn run_one(&self, job: Job) {
        *self.current_job.lock().unwrap() = Some(job.id);
        if let Err(e) = self.queue.process_job(&self.id, &job).await {
            error!(worker_id = %self.id, job_id = %job.id, error = %e, "job execution errored");
        }
        *self.current_job.lock().unwrap() = None;
    }

    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let current = self.current_job_id();
                    if let Err(e) = self.queue.store().heartbeat(&self.id, current).await {
                        warn!(worker_id = %self.id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_interval_is_twice_poll_capped_at_thirty() {
        let mut config = WorkerConfig::local();
        config.poll_interval = Duration::from_secs(5);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));

        config.poll_interval = Duration::from_secs(60);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn profiles_match_their_environments() {
        let local = WorkerConfig::local();
        assert_eq!(local.poll_interval, Duration::from_secs(5));
        assert!(local.max_execution_time.is_none());

        let constrained = WorkerConfig::constrained();
        assert_eq!(constrained.poll_interval, Duration::from_secs(1));
        assert_eq!(
            constrained.max_execution_time,
            Some(Duration::from_secs(25))
        );
        assert_eq!(constrained.batch_size, 5);
    }
}
