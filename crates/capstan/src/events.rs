//! Job lifecycle events and their in-process fan-out.
//!
//! Events are facts about the lifecycle, emitted synchronously with the state
//! transition that caused them. Listeners run before the queue method returns
//! to its caller; a panicking listener is contained and logged, never
//! propagated into the queue loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::job::Job;

/// Facts emitted by the job lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job was admitted to the queue.
    Created { job: Job },

    /// A running handler reported progress.
    Progress {
        job_id: Uuid,
        task_name: String,
        progress: i32,
    },

    /// A job completed; `result_key` resolves to the stored result.
    Completed {
        job_id: Uuid,
        task_name: String,
        result_key: String,
    },

    /// A job attempt failed. `will_retry` is false once the terminal Failed
    /// state was reached.
    Failed {
        job_id: Uuid,
        task_name: String,
        error: String,
        will_retry: bool,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Created { job } => job.id,
            Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

type Listener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerSets {
    created: Vec<Listener>,
    progress: Vec<Listener>,
    completed: Vec<Listener>,
    failed: Vec<Listener>,
}

/// Typed fan-out from event kind to an ordered list of callbacks.
///
/// Shared between the queue and the per-job helper contexts so progress
/// updates emit without a round trip through the queue.
#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<ListenerSets>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_created(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.listeners.write().unwrap().created.push(Arc::new(listener));
    }

    pub fn on_progress(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.listeners.write().unwrap().progress.push(Arc::new(listener));
    }

    pub fn on_completed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.listeners.write().unwrap().completed.push(Arc::new(listener));
    }

    pub fn on_failed(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.listeners.write().unwrap().failed.push(Arc::new(listener));
    }

    /// Invoke every listener registered for this event's kind, in
    /// registration order. Panics are contained per listener.
    pub fn emit(&self, event: &JobEvent) {
        let listeners = {
            let sets = self.listeners.read().unwrap();
            match event {
                JobEvent::Created { .. } => sets.created.clone(),
                JobEvent::Progress { .. } => sets.progress.clone(),
                JobEvent::Completed { .. } => sets.completed.clone(),
                JobEvent::Failed { .. } => sets.failed.clone(),
            }
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(job_id = %event.job_id(), "event listener panicked");
            }
        }
    }
}

/// Hook the lifecycle invokes for jobs that carry a `webhook_url`.
///
/// Delivery transport is the host's concern; implementations are expected to
/// be fire-and-forget and must not fail the lifecycle. The default sink does
/// nothing.
#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, job: &Job, event: &JobEvent);
}

/// Sink used when the host wires no webhook delivery.
pub struct NoopWebhookSink;

#[async_trait::async_trait]
impl WebhookSink for NoopWebhookSink {
    async fn deliver(&self, _job: &Job, _event: &JobEvent) {}
}
