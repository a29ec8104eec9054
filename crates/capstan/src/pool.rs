//! Worker pool: keeps N workers alive within [min, max], scaling on queue
//! depth.
//!
//! The controller is deliberately hysteretic — it grows only when the
//! backlog clearly outpaces the pool (`pending > workers × 3`) and shrinks
//! only on an empty backlog, one worker at a time, so marginal load changes
//! cause no churn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::Queue;
use crate::store::StorageAdapter;
use crate::worker::{Worker, WorkerConfig};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Controller cadence.
    pub check_interval: Duration,
    /// Configuration applied to every worker the pool starts.
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl PoolConfig {
    pub fn local() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            check_interval: Duration::from_secs(10),
            worker: WorkerConfig::local(),
        }
    }

    pub fn constrained() -> Self {
        Self {
            min_workers: 0,
            max_workers: 1,
            check_interval: Duration::from_secs(10),
            worker: WorkerConfig::constrained(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ScaleAction {
    Grow,
    Shrink,
    Hold,
}

fn scale_decision(pending: i64, current: usize, min: usize, max: usize) -> ScaleAction {
    if pending > current as i64 * 3 && current < max {
        ScaleAction::Grow
    } else if pending == 0 && current > min {
        ScaleAction::Shrink
    } else {
        ScaleAction::Hold
    }
}

struct PoolCore<S> {
    queue: Arc<Queue<S>>,
    config: PoolConfig,
    workers: tokio::sync::Mutex<Vec<Worker<S>>>,
    cancel: CancellationToken,
}

/// Maintains workers within `[min_workers, max_workers]`, starting
/// `min_workers` eagerly and adjusting on queue depth.
pub struct WorkerPool<S> {
    core: Arc<PoolCore<S>>,
    controller: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl<S: StorageAdapter + 'static> WorkerPool<S> {
    pub fn new(queue: Arc<Queue<S>>, config: PoolConfig) -> Self {
        Self {
            core: Arc::new(PoolCore {
                queue,
                config,
                workers: tokio::sync::Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
            controller: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.core.workers.lock().await.len()
    }

    /// Start `min_workers` eagerly and the scaling controller.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut workers = self.core.workers.lock().await;
            for _ in 0..self.core.config.min_workers {
                workers.push(self.core.spawn_worker());
            }
        }
        info!(
            min = self.core.config.min_workers,
            max = self.core.config.max_workers,
            "worker pool started"
        );

        let core = Arc::clone(&self.core);
        let controller = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = core.cancel.cancelled() => break,
                    _ = tokio::time::sleep(core.config.check_interval) => {
                        core.control_cycle().await;
                    }
                }
            }
        });
        *self.controller.lock().unwrap() = Some(controller);
    }

    /// Stop the controller and gracefully drain every worker.
    pub async fn shutdown(&self) {
        self.core.cancel.cancel();
        let controller = self.controller.lock().unwrap().take();
        if let Some(controller) = controller {
            let _ = controller.await;
        }

        let workers: Vec<_> = self.core.workers.lock().await.drain(..).collect();
        let total = workers.len();
        let drains = futures::future::join_all(
            workers
                .iter()
                .map(|worker| worker.graceful_shutdown(Duration::from_secs(30))),
        )
        .await;
        let clean = drains.into_iter().filter(|clean| *clean).count();
        info!(total, clean, "worker pool shut down");
    }
}

impl<S: StorageAdapter + 'static> PoolCore<S> {
    fn spawn_worker(&self) -> Worker<S> {
        let worker = Worker::new(Arc::clone(&self.queue), self.config.worker.clone());
        worker.start();
        worker
    }

    async fn control_cycle(&self) {
        let stats = match self.queue.get_queue_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "pool controller could not read queue stats");
                return;
            }
        };

        let mut workers = self.workers.lock().await;
        match scale_decision(
            stats.pending,
            workers.len(),
            self.config.min_workers,
            self.config.max_workers,
        ) {
            ScaleAction::Grow => {
                let worker = self.spawn_worker();
                debug!(worker_id = %worker.id(), pending = stats.pending, "scaling up");
                workers.push(worker);
            }
            ScaleAction::Shrink => {
                if let Some(worker) = workers.pop() {
                    debug!(worker_id = %worker.id(), "scaling down");
                    // One at a time; the next cycle shrinks further if still idle.
                    worker.graceful_shutdown(Duration::from_secs(30)).await;
                }
            }
            ScaleAction::Hold => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_when_backlog_outpaces_pool() {
        assert_eq!(scale_decision(10, 2, 1, 4), ScaleAction::Grow);
        assert_eq!(scale_decision(1, 0, 0, 1), ScaleAction::Grow);
    }

    #[test]
    fn holds_at_max_even_under_backlog() {
        assert_eq!(scale_decision(100, 4, 1, 4), ScaleAction::Hold);
    }

    #[test]
    fn shrinks_only_on_empty_backlog() {
        assert_eq!(scale_decision(0, 3, 1, 4), ScaleAction::Shrink);
        assert_eq!(scale_decision(1, 3, 1, 4), ScaleAction::Hold);
    }

    #[test]
    fn holds_at_min_when_idle() {
        assert_eq!(scale_decision(0, 1, 1, 4), ScaleAction::Hold);
    }

    #[test]
    fn hysteresis_ignores_marginal_backlog() {
        // pending == workers * 3 is not enough to grow.
        assert_eq!(scale_decision(6, 2, 1, 4), ScaleAction::Hold);
    }
}
