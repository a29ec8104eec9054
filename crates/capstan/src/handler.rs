//! Task handlers and the helper context they run with.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventHub, JobEvent, WebhookSink};
use crate::job::Job;
use crate::store::StorageAdapter;

/// A named unit of work the queue can execute.
///
/// Handlers receive the job payload and a [`JobContext`] of helpers. Every
/// helper call is a cancellation checkpoint: once the job's token is tripped
/// (kill or forced shutdown) the next helper call returns
/// [`Error::Cancelled`], which handlers should propagate with `?`.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the job. The returned value becomes the stored result unless
    /// the handler already stored one via [`JobContext::store_result`].
    async fn run(&self, payload: serde_json::Value, ctx: JobContext)
        -> Result<serde_json::Value>;
}

/// Any `async fn(payload, ctx) -> Result<Value>` closure is a handler.
#[async_trait::async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value> {
        (self)(payload, ctx).await
    }
}

/// Helpers handed to a running handler.
///
/// Cheap to clone; all clones refer to the same job execution.
#[derive(Clone)]
pub struct JobContext {
    job_id: Uuid,
    task_name: String,
    attempt: i32,
    webhook_url: Option<String>,
    store: Arc<dyn StorageAdapter>,
    events: Arc<EventHub>,
    webhook: Arc<dyn WebhookSink>,
    cancel: CancellationToken,
    // Floor for monotone progress within this Running interval.
    last_progress: Arc<AtomicI32>,
    stored_key: Arc<Mutex<Option<String>>>,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        store: Arc<dyn StorageAdapter>,
        events: Arc<EventHub>,
        webhook: Arc<dyn WebhookSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            task_name: job.task_name.clone(),
            attempt: job.attempts_made,
            webhook_url: job.webhook_url.clone(),
            store,
            events,
            webhook,
            cancel,
            last_progress: Arc::new(AtomicI32::new(job.progress)),
            stored_key: Arc::new(Mutex::new(None)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    /// The job's cancellation token, for handlers that want to `select!` on
    /// it rather than rely on helper checkpoints.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record progress, clamped to [0, 100] and never decreasing within this
    /// run. Emits a `Progress` event and triggers the webhook hook.
    pub async fn update_progress(&self, progress: i32) -> Result<()> {
        self.checkpoint()?;

        let clamped = progress.clamp(0, 100);
        let previous = self.last_progress.fetch_max(clamped, Ordering::SeqCst);
        if clamped <= previous {
            return Ok(());
        }

        self.store.update_job_progress(self.job_id, clamped).await?;

        let event = JobEvent::Progress {
            job_id: self.job_id,
            task_name: self.task_name.clone(),
            progress: clamped,
        };
        self.events.emit(&event);
        if self.webhook_url.is_some() {
            if let Ok(Some(job)) = self.store.get_job_by_id(self.job_id).await {
                self.webhook.deliver(&job, &event).await;
            }
        }
        Ok(())
    }

    /// Fetch the current persisted state of this job.
    pub async fn job_details(&self) -> Result<Job> {
        self.checkpoint()?;
        self.store
            .get_job_by_id(self.job_id)
            .await?
            .ok_or(Error::JobNotFound(self.job_id))
    }

    /// Store a result blob now, instead of returning it from the handler.
    /// The executor completes the job with this key.
    pub async fn store_result(&self, value: serde_json::Value) -> Result<String> {
        self.checkpoint()?;
        let key = self.store.store_result(self.job_id, value).await?;
        *self.stored_key.lock().unwrap() = Some(key.clone());
        Ok(key)
    }

    pub(crate) fn take_stored_key(&self) -> Option<String> {
        self.stored_key.lock().unwrap().take()
    }
}
