//! Execution strategies for fetched tasks
//!
//! The poll loop hands every non-empty task to one [`ExecutionStrategy`]:
//!
//! - [`InProcessStrategy`] - bounded worker pool inside the poller's process
//! - [`IsolatedProcessStrategy`] - one forked process per task
//!
//! ```text
//!              ┌──────────────┐
//!   task ─────▶│  dispatch()  │
//!              └──────┬───────┘
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//!  ┌───────────────┐     ┌─────────────────────────┐
//!  │  InProcess    │     │  IsolatedProcess        │
//!  │  semaphore    │     │  quiesce → fork         │
//!  │  N slots      │     │  child: reinit, run     │
//!  │  shared HB    │     │  parent: resume, wait   │
//!  └───────────────┘     └─────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::IsolationMode;
use crate::error::DispatchError;
use crate::heartbeat::HeartbeatPool;
use crate::lookup::ActivityLookup;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::processor::{ExecutionContext, TaskProcessor};
use crate::task::{ActivityTask, QueueId};

mod in_process;
mod isolated;

pub use in_process::InProcessStrategy;
pub use isolated::{
    run_isolated_child, ForkLauncher, Forked, IsolatedProcessStrategy, ProcessLauncher,
};

/// Where a fetched task runs
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Hand a task over for execution
    ///
    /// Returns once the strategy has accepted the task. May block while the
    /// strategy is at capacity.
    async fn dispatch(&self, task: ActivityTask) -> Result<(), DispatchError>;

    /// Wait for accepted work to finish and release owned resources
    async fn release(&self);

    /// Isolation mode this strategy implements
    fn mode(&self) -> IsolationMode;
}

/// Inputs shared by every execution of one poller
pub struct ExecutionEnv {
    /// Queue being served
    pub queue: QueueId,

    /// Registered activities
    pub lookup: Arc<ActivityLookup>,

    /// Registered middleware, instantiated per execution
    pub middleware: Vec<Arc<dyn Middleware>>,

    /// Processor running each task
    pub processor: Arc<dyn TaskProcessor>,
}

impl ExecutionEnv {
    /// Build the context for one execution
    pub fn context(&self, task: ActivityTask, heartbeats: Arc<HeartbeatPool>) -> ExecutionContext {
        ExecutionContext::new(
            task,
            self.queue.clone(),
            MiddlewareChain::new(&self.middleware),
            Arc::clone(&self.lookup),
            heartbeats,
        )
    }
}

impl std::fmt::Debug for ExecutionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnv")
            .field("queue", &self.queue)
            .field("lookup", &self.lookup)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
