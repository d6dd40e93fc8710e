// Activity worker
// Decision: One poller per registered (namespace, task_queue); every poller shares the
//           connection, processor and middleware list handed to the worker
// Decision: Shutdown is stop all -> cancel all -> wait all, so no poller sits in a long
//           poll while another is being drained

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::PollerConfig;
use crate::error::PollerError;
use crate::lookup::{Activity, ActivityLookup};
use crate::middleware::Middleware;
use crate::poller::{Poller, PollerDeps};
use crate::task::QueueId;

// =============================================================================
// Worker
// =============================================================================

/// Registration layer owning the pollers of a process
pub struct Worker {
    deps: PollerDeps,
    config: PollerConfig,
    lookups: HashMap<QueueId, ActivityLookup>,
    middleware: Vec<Arc<dyn Middleware>>,
    pollers: Mutex<Vec<Arc<Poller>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Worker {
    /// Create a worker with no registrations
    pub fn new(deps: PollerDeps, config: PollerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            deps,
            config,
            lookups: HashMap::new(),
            middleware: Vec::new(),
            pollers: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Create a worker configured from environment variables
    pub fn from_env(deps: PollerDeps) -> Result<Self, PollerError> {
        Ok(Self::new(deps, PollerConfig::from_env()?))
    }

    /// Register an activity type on a queue
    pub fn register_activity(
        &mut self,
        queue: QueueId,
        name: impl Into<String>,
        activity: Arc<dyn Activity>,
    ) -> &mut Self {
        self.lookups.entry(queue).or_default().add(name, activity);
        self
    }

    /// Register the fallback activity for a queue
    ///
    /// A queue has at most one dynamic activity.
    pub fn register_dynamic_activity(
        &mut self,
        queue: QueueId,
        name: impl Into<String>,
        activity: Arc<dyn Activity>,
    ) -> Result<&mut Self, PollerError> {
        self.lookups
            .entry(queue)
            .or_default()
            .add_dynamic(name, activity)?;
        Ok(self)
    }

    /// Add middleware wrapped around every execution, in registration order
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Queues with at least one registration, sorted
    pub fn queues(&self) -> Vec<QueueId> {
        let mut queues: Vec<QueueId> = self.lookups.keys().cloned().collect();
        queues.sort_by(|a, b| {
            (&a.namespace, &a.task_queue).cmp(&(&b.namespace, &b.task_queue))
        });
        queues
    }

    /// Pollers of the current run
    pub fn pollers(&self) -> Vec<Arc<Poller>> {
        self.pollers.lock().clone()
    }

    /// Ask a running worker to shut down
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run until [`Worker::stop`] is called
    pub async fn run(&self) -> Result<(), PollerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run every poller until `shutdown` resolves or [`Worker::stop`] is called
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), PollerError>
    where
        F: Future<Output = ()>,
    {
        let pollers = self.build_pollers()?;
        *self.pollers.lock() = pollers.clone();

        let mut loops = JoinSet::new();
        for poller in &pollers {
            let poller = Arc::clone(poller);
            loops.spawn(async move { poller.start().await });
        }
        info!(pollers = pollers.len(), mode = %self.config.isolation_mode, "Activity worker started");

        let mut stop_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown => {}
            _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {}
        }

        info!("Activity worker shutting down");
        for poller in &pollers {
            poller.stop_polling();
        }
        for poller in &pollers {
            poller.cancel_pending_requests();
        }
        for poller in &pollers {
            poller.wait().await?;
        }

        while let Some(result) = loops.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Activity poller exited with error"),
                Err(e) => error!(error = %e, "Activity poller task failed"),
            }
        }

        info!("Activity worker stopped");
        Ok(())
    }

    fn build_pollers(&self) -> Result<Vec<Arc<Poller>>, PollerError> {
        self.queues()
            .into_iter()
            .map(|queue| {
                let lookup = self.lookups.get(&queue).cloned().unwrap_or_default();
                Poller::new(
                    queue,
                    Arc::new(lookup),
                    self.middleware.clone(),
                    self.config.clone(),
                    self.deps.clone(),
                )
                .map(Arc::new)
            })
            .collect()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("queues", &self.queues())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{ActivityError, LookupError};
    use crate::poller::Lifecycle;
    use crate::processor::ExecutionContext;
    use crate::testing::{RecordingProcessor, ScriptedConnection};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Activity for Noop {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, ActivityError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn worker() -> Worker {
        let deps = PollerDeps::new(
            Arc::new(ScriptedConnection::new(vec![])),
            Arc::new(RecordingProcessor::new()),
        );
        Worker::new(deps, PollerConfig::new())
    }

    #[test]
    fn test_second_dynamic_activity_is_rejected() {
        let mut worker = worker();
        let queue = QueueId::new("default", "q");
        worker
            .register_dynamic_activity(queue.clone(), "first", Arc::new(Noop))
            .unwrap();

        let err = worker
            .register_dynamic_activity(queue.clone(), "second", Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(
            err,
            PollerError::Lookup(LookupError::SecondDynamicActivity { ref previous, .. }) if previous == "first"
        ));

        // another queue has its own slot
        worker
            .register_dynamic_activity(QueueId::new("default", "other"), "second", Arc::new(Noop))
            .unwrap();
    }

    #[test]
    fn test_queues_are_sorted() {
        let mut worker = worker();
        worker
            .register_activity(QueueId::new("b", "q"), "x", Arc::new(Noop))
            .register_activity(QueueId::new("a", "z"), "x", Arc::new(Noop))
            .register_activity(QueueId::new("a", "q"), "y", Arc::new(Noop));

        let queues: Vec<String> = worker.queues().iter().map(|q| q.to_string()).collect();
        assert_eq!(queues, vec!["a/q", "a/z", "b/q"]);
    }

    #[tokio::test]
    async fn test_stop_shuts_down_every_poller() {
        let mut worker = worker();
        worker
            .register_activity(QueueId::new("default", "one"), "x", Arc::new(Noop))
            .register_activity(QueueId::new("default", "two"), "x", Arc::new(Noop));
        let worker = Arc::new(worker);

        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        while worker.pollers().len() < 2 {
            tokio::task::yield_now().await;
        }

        worker.stop();
        running.await.unwrap().unwrap();

        for poller in worker.pollers() {
            assert_eq!(poller.lifecycle(), Lifecycle::ShuttingDown);
        }
    }
}
