// Connection boundary
// Decision: The wire protocol lives outside this crate; the poller only needs a long poll,
//           a way to cancel it, and the fork-safety hooks
// Decision: Cancellation names the queue; one connection may serve several pollers, one per queue
// Decision: Fork safety is a capability trait every connection implements, so the isolated
//           strategy can run the quiesce/resume protocol without knowing the transport

use async_trait::async_trait;

use crate::task::{ActivityTask, QueueId};

/// Errors returned by a long poll
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    /// The in-flight poll was cancelled (shutdown in progress)
    #[error("poll request cancelled")]
    Cancelled,

    /// Remote endpoint unavailable
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// Any other transport or protocol failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether this is the cooperative cancellation raised during shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Pre/post process duplication hooks for a connection holding a network channel
///
/// A channel cannot be live in two process images descended from the same
/// `fork`. Callers run the three phases in order:
///
/// 1. [`prepare_for_duplication`](ForkSafety::prepare_for_duplication) in the parent, before forking
/// 2. [`reinitialize_after_duplication_as_child`](ForkSafety::reinitialize_after_duplication_as_child) first thing in the child
/// 3. [`resume_after_duplication_as_parent`](ForkSafety::resume_after_duplication_as_parent) in the parent, right after forking
///
/// Phase 3 also runs when the fork itself fails.
pub trait ForkSafety: Send + Sync {
    /// Drain or pause shared network state
    fn prepare_for_duplication(&self);

    /// Resume network state in the original process
    fn resume_after_duplication_as_parent(&self);

    /// Rebuild per-process network state in the duplicate
    fn reinitialize_after_duplication_as_child(&self);
}

/// Connection to the remote task queue
#[async_trait]
pub trait Connection: ForkSafety {
    /// Long-poll the queue for one activity task
    ///
    /// Blocks until work arrives, the server-side timeout expires (an empty
    /// task is returned), or [`cancel_pending_poll`](Connection::cancel_pending_poll)
    /// is called for `queue` (returns [`ConnectionError::Cancelled`]).
    async fn poll_activity_task(&self, queue: &QueueId) -> Result<ActivityTask, ConnectionError>;

    /// Cancel the poll in flight for `queue`, if any
    ///
    /// Polls for other queues on the same connection are left running.
    fn cancel_pending_poll(&self, queue: &QueueId);
}
