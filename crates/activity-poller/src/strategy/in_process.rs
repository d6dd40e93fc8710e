//! In-process execution on a bounded worker pool
//!
//! Up to `concurrency` executions run at once. `dispatch` waits for a free
//! slot, so a saturated pool holds the poll loop back instead of queueing
//! unbounded work.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, instrument, trace};

use super::{ExecutionEnv, ExecutionStrategy};
use crate::config::IsolationMode;
use crate::error::DispatchError;
use crate::heartbeat::HeartbeatPool;
use crate::task::{ActivityTask, QueueId};

/// Bounded in-process worker pool
pub struct InProcessStrategy {
    env: Arc<ExecutionEnv>,
    concurrency: usize,
    slots: Arc<Semaphore>,
    executions: Mutex<JoinSet<()>>,
    heartbeats: OnceLock<Arc<HeartbeatPool>>,
}

impl InProcessStrategy {
    /// Create a pool running at most `concurrency` executions at once
    pub fn new(env: Arc<ExecutionEnv>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            env,
            concurrency,
            slots: Arc::new(Semaphore::new(concurrency)),
            executions: Mutex::new(JoinSet::new()),
            heartbeats: OnceLock::new(),
        }
    }

    /// Maximum simultaneous executions
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Executions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.concurrency
            .saturating_sub(self.slots.available_permits())
    }

    /// Shared heartbeat pool, created on first use
    pub fn heartbeat_pool(&self) -> Arc<HeartbeatPool> {
        Arc::clone(self.heartbeats.get_or_init(|| {
            Arc::new(HeartbeatPool::new(self.concurrency, self.env.queue.clone()))
        }))
    }

    /// Whether the heartbeat pool has been created
    pub fn has_heartbeat_pool(&self) -> bool {
        self.heartbeats.get().is_some()
    }

    fn log_join_result(queue: &QueueId, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                error!(
                    namespace = %queue.namespace,
                    task_queue = %queue.task_queue,
                    "Activity execution panicked"
                );
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for InProcessStrategy {
    async fn dispatch(&self, task: ActivityTask) -> Result<(), DispatchError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Closed)?;

        let ctx = self.env.context(task, self.heartbeat_pool());
        let processor = Arc::clone(&self.env.processor);

        let mut executions = self.executions.lock();
        if self.slots.is_closed() {
            return Err(DispatchError::Closed);
        }
        while let Some(result) = executions.try_join_next() {
            Self::log_join_result(&self.env.queue, result);
        }

        executions.spawn(async move {
            let _permit = permit;
            let execution_id = ctx.execution_id;
            let outcome = processor.process(ctx).await;
            trace!(%execution_id, completed = outcome.is_completed(), "Execution finished");
        });

        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.env.queue.namespace, task_queue = %self.env.queue.task_queue))]
    async fn release(&self) {
        self.slots.close();
        let mut executions = std::mem::take(&mut *self.executions.lock());

        if !executions.is_empty() {
            debug!(in_flight = executions.len(), "Waiting for in-flight executions");
        }
        while let Some(result) = executions.join_next().await {
            Self::log_join_result(&self.env.queue, result);
        }

        // only release a pool that exists; never create one here
        if let Some(pool) = self.heartbeats.get() {
            pool.release().await;
        }
    }

    fn mode(&self) -> IsolationMode {
        IsolationMode::InProcess
    }
}

impl std::fmt::Debug for InProcessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessStrategy")
            .field("queue", &self.env.queue)
            .field("concurrency", &self.concurrency)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::ActivityLookup;
    use crate::testing::RecordingProcessor;
    use std::time::Duration;

    fn strategy(processor: Arc<RecordingProcessor>, concurrency: usize) -> InProcessStrategy {
        let env = ExecutionEnv {
            queue: QueueId::new("default", "pool"),
            lookup: Arc::new(ActivityLookup::new()),
            middleware: vec![],
            processor,
        };
        InProcessStrategy::new(Arc::new(env), concurrency)
    }

    fn task(name: &str) -> ActivityTask {
        ActivityTask::new(name, serde_json::Value::Null)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_blocks_when_saturated() {
        let (processor, gate) = RecordingProcessor::gated();
        let pool = strategy(Arc::clone(&processor), 2);

        pool.dispatch(task("a")).await.unwrap();
        pool.dispatch(task("b")).await.unwrap();
        assert_eq!(pool.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_secs(5), pool.dispatch(task("c"))).await;
        assert!(blocked.is_err(), "third dispatch must wait for a free slot");

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), pool.dispatch(task("c")))
            .await
            .expect("slot freed")
            .unwrap();

        gate.add_permits(2);
        pool.release().await;
        assert_eq!(processor.started_types(), vec!["a", "b", "c"]);
        assert_eq!(processor.max_running(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_one_runs_sequentially() {
        let processor = Arc::new(RecordingProcessor::new());
        let pool = strategy(Arc::clone(&processor), 1);

        for name in ["a", "b", "c", "d"] {
            pool.dispatch(task(name)).await.unwrap();
        }
        pool.release().await;

        assert_eq!(processor.started_types(), vec!["a", "b", "c", "d"]);
        assert_eq!(processor.max_running(), 1);
    }

    #[tokio::test]
    async fn test_release_drains_and_closes() {
        let processor = Arc::new(RecordingProcessor::new());
        let pool = strategy(Arc::clone(&processor), 4);

        assert!(!pool.has_heartbeat_pool());
        pool.dispatch(task("a")).await.unwrap();
        assert!(pool.has_heartbeat_pool());
        assert_eq!(pool.heartbeat_pool().size(), 4);

        pool.release().await;
        assert_eq!(processor.completed(), 1);
        assert!(pool.heartbeat_pool().is_released());
        assert!(matches!(
            pool.dispatch(task("b")).await,
            Err(DispatchError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_release_without_dispatch_creates_no_heartbeat_pool() {
        let pool = strategy(Arc::new(RecordingProcessor::new()), 3);
        pool.release().await;
        assert!(!pool.has_heartbeat_pool());
        assert_eq!(pool.mode(), IsolationMode::InProcess);
    }
}
