//! Error taxonomy for the queue, workers and scheduler.
//!
//! The variants map to distinct handling policies:
//!
//! - [`Error::Storage`] — transient store faults. Background loops log these
//!   and keep going; API callers see them verbatim.
//! - [`Error::Handler`] — a task handler failed. The store applies the retry
//!   policy (backoff while attempts remain, terminal failure otherwise).
//! - [`Error::Cancelled`] — the sentinel raised by job helpers once the job's
//!   cancellation token has been tripped. The executor recognizes it and does
//!   not record a failure (the canceller already did).
//! - Everything else is a contract violation surfaced to the caller with no
//!   state mutation.

use std::time::Duration;

use uuid::Uuid;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A connection or query error from the storage adapter.
    #[error("storage fault: {0}")]
    Storage(#[source] anyhow::Error),

    /// A task handler returned an error.
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// The job's cancellation token was tripped; raised by job helpers at
    /// their next call.
    #[error("job cancelled")]
    Cancelled,

    /// `add_job` was called with a task name no handler is registered for.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// No job exists with this id.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// No schedule exists with this id.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// The operation requires a Running job (e.g. kill) but the job is not.
    #[error("job {id} is not running (status: {status})")]
    NotRunning { id: Uuid, status: &'static str },

    /// A cron pattern failed validation.
    #[error("invalid cron pattern {pattern:?}: {reason}")]
    InvalidCronPattern { pattern: String, reason: String },

    /// A schedule operation violated its preconditions (past run time,
    /// end date before start date, pausing a non-scheduled entry, ...).
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The queue is shutting down and refuses new admissions.
    #[error("queue is shutting down")]
    ShuttingDown,

    /// Drain exceeded its timeout and `force` was not set.
    #[error("shutdown timed out after {timeout:?} with {remaining} jobs still running")]
    ShutdownTimeout { timeout: Duration, remaining: usize },
}

impl Error {
    /// Wrap a lower-level fault as a storage fault.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Error::Storage(err.into())
    }

    /// Wrap a handler-originated fault.
    pub fn handler(err: impl Into<anyhow::Error>) -> Self {
        Error::Handler(err.into())
    }

    /// Whether this error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_recognizable() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::UnknownTask("x".into()).is_cancelled());
    }

    #[test]
    fn storage_wraps_source() {
        let err = Error::storage(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.to_string().starts_with("storage fault"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn display_includes_context() {
        let id = Uuid::nil();
        let err = Error::NotRunning {
            id,
            status: "pending",
        };
        assert!(err.to_string().contains("not running"));
        assert!(err.to_string().contains("pending"));

        let err = Error::InvalidCronPattern {
            pattern: "* *".into(),
            reason: "expected 5 fields".into(),
        };
        assert!(err.to_string().contains("* *"));
    }
}
