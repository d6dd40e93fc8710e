// Task processor boundary
// Decision: Business-level failures are reported by the processor itself; the poller only
//           sees a ProcessOutcome and never changes control flow because of it
// Decision: ExecutionContext is owned by the processor for one execution, so heartbeats
//           scheduled through it stop when it is dropped

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::heartbeat::{HeartbeatError, HeartbeatHandle, HeartbeatPool, HeartbeatScope};
use crate::lookup::{ActivityError, ActivityLookup};
use crate::middleware::MiddlewareChain;
use crate::task::{ActivityTask, QueueId};

/// Result of processing one task
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The activity completed with this output
    Completed(serde_json::Value),

    /// The activity failed; the failure has been reported
    Failed(ActivityError),
}

impl ProcessOutcome {
    /// Shorthand for a failure with a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(ActivityError::new(message))
    }

    /// Whether processing completed successfully
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl From<Result<serde_json::Value, ActivityError>> for ProcessOutcome {
    fn from(result: Result<serde_json::Value, ActivityError>) -> Self {
        match result {
            Ok(output) => Self::Completed(output),
            Err(error) => Self::Failed(error),
        }
    }
}

/// How an isolated worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Processor reported completion (exit code 0)
    Succeeded,

    /// Processor reported a failure it already handled (exit code 1)
    Failed,

    /// Any other exit code, e.g. a panic while processing
    Exited(i32),

    /// Killed by a signal
    Signaled(i32),
}

impl ChildExit {
    /// Exit code for a completed task
    pub const SUCCESS_CODE: i32 = 0;
    /// Exit code for a task whose failure was reported by the processor
    pub const FAILURE_CODE: i32 = 1;
    /// Exit code when processing panicked
    pub const PANIC_CODE: i32 = 101;
    /// Exit code when the child could not set up its runtime
    pub const SETUP_FAILURE_CODE: i32 = 70;

    /// Map a process exit code
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::SUCCESS_CODE => Self::Succeeded,
            Self::FAILURE_CODE => Self::Failed,
            other => Self::Exited(other),
        }
    }

    /// Exit code a child should use for an outcome
    pub fn code_for(outcome: &ProcessOutcome) -> i32 {
        if outcome.is_completed() {
            Self::SUCCESS_CODE
        } else {
            Self::FAILURE_CODE
        }
    }

    /// Whether the child ended without the processor reporting an outcome
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Everything one execution of a task needs
#[derive(Debug)]
pub struct ExecutionContext {
    /// Unique id of this execution
    pub execution_id: Uuid,

    /// Task being executed
    pub task: ActivityTask,

    /// Queue the task came from
    pub queue: QueueId,

    /// Middleware for this execution
    pub middleware: MiddlewareChain,

    /// Registered activities for the queue
    pub lookup: Arc<ActivityLookup>,

    heartbeats: HeartbeatScope,
}

impl ExecutionContext {
    /// Create a context for one execution
    pub fn new(
        task: ActivityTask,
        queue: QueueId,
        middleware: MiddlewareChain,
        lookup: Arc<ActivityLookup>,
        heartbeat_pool: Arc<HeartbeatPool>,
    ) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            task,
            queue,
            middleware,
            lookup,
            heartbeats: HeartbeatScope::new(heartbeat_pool),
        }
    }

    /// Activity type of the task
    pub fn activity_type(&self) -> Option<&str> {
        self.task.activity_type.as_deref()
    }

    /// Heartbeat scope of this execution
    pub fn heartbeats(&self) -> &HeartbeatScope {
        &self.heartbeats
    }

    /// Schedule a periodic heartbeat for this execution
    pub fn heartbeat_every<F, Fut>(
        &self,
        interval: Duration,
        callback: F,
    ) -> Result<HeartbeatHandle, HeartbeatError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = format!("{}:{}", self.task.activity_id, self.execution_id);
        self.heartbeats.every(key, interval, callback)
    }

    /// Resolve the activity and run it through the middleware chain
    pub async fn execute_activity(&self) -> ProcessOutcome {
        let Some(name) = self.activity_type() else {
            return ProcessOutcome::Failed(
                ActivityError::new("task has no activity type").with_type("EmptyTask"),
            );
        };

        let Some(activity) = self.lookup.find(name) else {
            return ProcessOutcome::Failed(
                ActivityError::new(format!("activity {name} is not registered"))
                    .with_type("ActivityNotRegistered"),
            );
        };

        self.middleware
            .invoke(&self.queue, &self.task, move || async move {
                ProcessOutcome::from(activity.execute(self).await)
            })
            .await
    }
}

/// Runs one task to completion or failure
///
/// Implementations report results to the remote endpoint themselves.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process one task
    async fn process(&self, ctx: ExecutionContext) -> ProcessOutcome;

    /// Called in the poller's process when an isolated worker process ended
    /// without reporting an outcome (crash, signal, panic)
    async fn report_abnormal_exit(&self, queue: &QueueId, task: &ActivityTask, exit: ChildExit) {
        warn!(
            namespace = %queue.namespace,
            task_queue = %queue.task_queue,
            activity_type = ?task.activity_type,
            exit = %exit,
            "Isolated activity process ended abnormally"
        );
    }
}
