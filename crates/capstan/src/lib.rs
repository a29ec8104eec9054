//! # Capstan
//!
//! A durable, database-backed job queue and scheduler: callers submit named
//! tasks with opaque JSON payloads, workers claim them exclusively and run
//! registered handlers, and a scheduler turns one-time and cron-recurring
//! schedules into concrete jobs when their time arrives.
//!
//! ## Architecture
//!
//! ```text
//! add_job() / schedule_*()
//!     │
//!     ▼
//! StorageAdapter (Pending) ◄────────── Scheduler tick (materialization)
//!     │
//!     ▼ fetch_next_job()  — atomic claim, SKIP LOCKED on SQL stores
//! Worker loop ──► Queue::process_job()
//!     │                │
//!     │ heartbeats     ├─► handler.run(payload, ctx)
//!     │                │       ctx: progress / job details / results /
//!     │                │            cancellation checkpoints
//!     ▼                ▼
//! stale sweep     Completed | Failed | Pending-with-backoff
//!                      │
//!                      ▼
//!                  events (Created / Progress / Completed / Failed)
//! ```
//!
//! ## Key invariants
//!
//! 1. **At most one owner** — a Running job belongs to exactly one worker;
//!    the claim is atomic and never hands a job to two callers.
//! 2. **At-least-once** — a crashed worker's job is re-claimed after its
//!    heartbeat goes stale while attempts remain (a crash on the final
//!    attempt fails it terminally); handlers must tolerate re-execution.
//! 3. **Attempts are consumed at claim time** — a crash still burns an
//!    attempt; retry backoff is `2^attempts_made` seconds.
//! 4. **Progress is monotone** — clamped to [0, 100], never decreasing
//!    within a Running interval.
//! 5. **Events are synchronous facts** — listeners run with the transition
//!    that caused them; their panics are contained.
//!
//! ## Example
//!
//! ```ignore
//! use capstan::{JobOptions, Queue, Worker, WorkerConfig};
//! use capstan_memory::MemoryStore;
//! use std::sync::Arc;
//!
//! let queue = Arc::new(Queue::new(MemoryStore::new()));
//! queue.init().await?;
//!
//! queue.register_task("email:send", |payload, ctx| async move {
//!     ctx.update_progress(50).await?;
//!     // ... deliver ...
//!     Ok(serde_json::json!({ "delivered": true }))
//! });
//!
//! let job = queue
//!     .add_job("email:send", serde_json::json!({ "to": "a@example.com" }), JobOptions::default())
//!     .await?;
//!
//! let worker = Arc::new(Worker::new(Arc::clone(&queue), WorkerConfig::local()));
//! worker.start();
//! ```
//!
//! ## What this crate is not
//!
//! Capstan is **not** a transport: HTTP intake, webhook delivery and blob
//! storage belong to the host. It is **not** exactly-once: the contract is
//! at-least-once with idempotent handlers. And it is **not** strictly
//! ordered beyond `priority DESC, run_at ASC, created_at ASC` claims.

mod error;
mod events;
mod handler;
mod job;
mod pool;
mod queue;
mod schedule;
mod scheduler;
mod store;
mod worker;

pub use crate::error::{Error, Result};

pub use crate::job::{
    DetailedJobInfo, Job, JobFilter, JobOptions, JobStatus, QueueStats, WorkerHeartbeat,
};

pub use crate::schedule::{
    next_occurrence, parse_pattern, Schedule, ScheduleFilter, ScheduleKind, ScheduleOptions,
    ScheduleStatus, ScheduleUpdate,
};

pub use crate::store::{
    RemoveOptions, SchedulerStore, StorageAdapter, DEFAULT_STALE_THRESHOLD,
};

pub use crate::events::{EventHub, JobEvent, NoopWebhookSink, WebhookSink};

pub use crate::handler::{JobContext, TaskHandler};

pub use crate::queue::{Queue, ShutdownOptions};

pub use crate::worker::{Worker, WorkerConfig};

pub use crate::pool::{PoolConfig, WorkerPool};

pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerMetrics, SchedulerStatus};

// Re-export commonly used external types
pub use async_trait::async_trait;
