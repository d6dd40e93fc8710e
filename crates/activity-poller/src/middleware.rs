//! Activity middleware
//!
//! Middleware runs around every execution: `before` hooks in registration
//! order, `after` hooks in reverse order with the outcome.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::processor::ProcessOutcome;
use crate::task::{ActivityTask, QueueId};

/// Hook around activity executions
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called before the activity runs
    async fn before(&self, _queue: &QueueId, _task: &ActivityTask) {}

    /// Called after the activity finished
    async fn after(&self, _queue: &QueueId, _task: &ActivityTask, _outcome: &ProcessOutcome) {}
}

/// Middleware stack for a single execution
///
/// Built fresh from the shared registration list for each dispatched task.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Build a chain from registered middleware
    pub fn new(entries: &[Arc<dyn Middleware>]) -> Self {
        Self {
            entries: entries.to_vec(),
        }
    }

    /// Number of middleware entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `body` wrapped by every middleware
    pub async fn invoke<F, Fut>(
        &self,
        queue: &QueueId,
        task: &ActivityTask,
        body: F,
    ) -> ProcessOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProcessOutcome>,
    {
        for entry in &self.entries {
            entry.before(queue, task).await;
        }

        let outcome = body().await;

        for entry in self.entries.iter().rev() {
            entry.after(queue, task, &outcome).await;
        }

        outcome
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.entries.len())
            .finish()
    }
}
