//! Poller errors and the pluggable error handler

use crate::connection::ConnectionError;
use crate::lookup::LookupError;
use crate::task::QueueId;

/// Errors from dispatching a task to an execution strategy
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The strategy has been released and accepts no more work
    #[error("execution strategy is closed")]
    Closed,

    /// Duplicating the process failed
    #[error("failed to fork isolated worker process: {0}")]
    Fork(#[source] std::io::Error),

    /// Waiting for the isolated worker process failed
    #[error("failed to wait for isolated worker process {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    /// Process isolation is not available on this platform
    #[error("process isolation is not supported on this platform")]
    Unsupported,

    /// The blocking dispatch task could not be joined
    #[error("dispatch task failed: {0}")]
    Join(String),
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Transient poll failure
    #[error("poll failed: {0}")]
    Connection(#[from] ConnectionError),

    /// Task dispatch failed
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// `wait` was called before `stop_polling`
    #[error("activity poller waiting for shutdown completion without being in shutting_down state")]
    WaitBeforeShutdown,

    /// `start` was called on a poller whose loop is already running
    #[error("activity poller is already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Activity registration failed
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Receives failures the poll loop recovers from
///
/// Called for transient poll failures and failed dispatches, after they have
/// been logged. Never called for cancellation during shutdown.
pub trait ErrorHandler: Send + Sync {
    /// Handle one failure
    fn handle(&self, error: &PollerError, queue: &QueueId);
}

impl<F> ErrorHandler for F
where
    F: Fn(&PollerError, &QueueId) + Send + Sync,
{
    fn handle(&self, error: &PollerError, queue: &QueueId) {
        self(error, queue)
    }
}

/// Error handler that does nothing beyond the poller's own logging
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreErrors;

impl ErrorHandler for IgnoreErrors {
    fn handle(&self, _error: &PollerError, _queue: &QueueId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = move |error: &PollerError, queue: &QueueId| {
            assert!(matches!(error, PollerError::Connection(_)));
            assert_eq!(queue.task_queue, "q");
            counter.fetch_add(1, Ordering::SeqCst);
        };

        handler.handle(
            &ConnectionError::Transport("reset".into()).into(),
            &QueueId::new("default", "q"),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_messages() {
        let err = PollerError::WaitBeforeShutdown;
        assert!(err.to_string().contains("without being in shutting_down state"));

        let err: PollerError = DispatchError::Closed.into();
        assert_eq!(err.to_string(), "dispatch failed: execution strategy is closed");
    }
}
