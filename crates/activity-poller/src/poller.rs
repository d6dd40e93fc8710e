//! Activity task poller
//!
//! One long-poll loop per `(namespace, task_queue)`. Each non-empty task is
//! handed to the configured [`ExecutionStrategy`]; the loop runs until
//! [`Poller::stop_polling`] is observed at the top of an iteration.
//!
//! Shutdown sequence driven by the owner:
//!
//! ```text
//! stop_polling()              lifecycle -> ShuttingDown
//! cancel_pending_requests()   unblocks a parked long poll
//! wait()                      loop exited, strategy drained, heartbeats released
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{IsolationMode, PollerConfig};
use crate::connection::Connection;
use crate::error::{ErrorHandler, IgnoreErrors, PollerError};
use crate::lookup::ActivityLookup;
use crate::metrics::{keys, LogMetrics, MetricTags, MetricsSink};
use crate::middleware::Middleware;
use crate::processor::TaskProcessor;
use crate::strategy::{
    ExecutionEnv, ExecutionStrategy, ForkLauncher, InProcessStrategy, IsolatedProcessStrategy,
    ProcessLauncher,
};
use crate::task::{ActivityTask, QueueId};

/// Poller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, loop not started
    Idle = 0,
    /// Loop running
    Running = 1,
    /// Shutdown requested; terminal
    ShuttingDown = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::ShuttingDown,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// State shared between the poll loop and the thread asking it to stop
#[derive(Debug)]
pub struct PollerState {
    lifecycle: AtomicU8,
    last_poll_time: Mutex<Instant>,
    shutdown: CancellationToken,
    loop_active: watch::Sender<bool>,
}

impl PollerState {
    fn new() -> Self {
        let (loop_active, _) = watch::channel(false);
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Idle as u8),
            last_poll_time: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            loop_active,
        }
    }

    /// Current lifecycle, read fresh
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// When the last poll call returned
    pub fn last_poll_time(&self) -> Instant {
        *self.last_poll_time.lock()
    }

    fn is_shutting_down(&self) -> bool {
        self.lifecycle() == Lifecycle::ShuttingDown
    }

    /// Idle -> Running, marking the loop active under the same lock `wait` reads
    fn begin_running(&self) -> Lifecycle {
        let mut observed = Lifecycle::Idle;
        self.loop_active.send_if_modified(|active| {
            match self.lifecycle.compare_exchange(
                Lifecycle::Idle as u8,
                Lifecycle::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    *active = true;
                    true
                }
                Err(current) => {
                    observed = Lifecycle::from_u8(current);
                    false
                }
            }
        });
        observed
    }

    /// Returns the lifecycle before the call
    fn request_shutdown(&self) -> Lifecycle {
        let previous = self
            .lifecycle
            .swap(Lifecycle::ShuttingDown as u8, Ordering::AcqRel);
        self.shutdown.cancel();
        Lifecycle::from_u8(previous)
    }

    fn touch(&self) {
        *self.last_poll_time.lock() = Instant::now();
    }
}

// Marks the loop inactive even when the `start` future is dropped mid-loop.
struct ActiveLoop<'a>(&'a watch::Sender<bool>);

impl Drop for ActiveLoop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Collaborators a poller calls into
#[derive(Clone)]
pub struct PollerDeps {
    pub connection: Arc<dyn Connection>,
    pub processor: Arc<dyn TaskProcessor>,
    pub metrics: Arc<dyn MetricsSink>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub launcher: Arc<dyn ProcessLauncher>,
}

impl PollerDeps {
    /// Log-only metrics, no extra error handling, real `fork`
    pub fn new(connection: Arc<dyn Connection>, processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            connection,
            processor,
            metrics: Arc::new(LogMetrics),
            error_handler: Arc::new(IgnoreErrors),
            launcher: Arc::new(ForkLauncher),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }
}

impl std::fmt::Debug for PollerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerDeps").finish_non_exhaustive()
    }
}

/// Long-poll loop for one task queue
pub struct Poller {
    queue: QueueId,
    config: PollerConfig,
    connection: Arc<dyn Connection>,
    metrics: Arc<dyn MetricsSink>,
    error_handler: Arc<dyn ErrorHandler>,
    strategy: Box<dyn ExecutionStrategy>,
    state: PollerState,
}

impl Poller {
    /// Create a poller; the execution strategy is chosen by `config.isolation_mode`
    pub fn new(
        queue: QueueId,
        lookup: Arc<ActivityLookup>,
        middleware: Vec<Arc<dyn Middleware>>,
        config: PollerConfig,
        deps: PollerDeps,
    ) -> Result<Self, PollerError> {
        config.validate()?;

        let env = Arc::new(ExecutionEnv {
            queue: queue.clone(),
            lookup,
            middleware,
            processor: deps.processor,
        });

        let strategy: Box<dyn ExecutionStrategy> = match config.isolation_mode {
            IsolationMode::InProcess => {
                Box::new(InProcessStrategy::new(env, config.concurrency))
            }
            IsolationMode::IsolatedProcess => Box::new(IsolatedProcessStrategy::new(
                env,
                Arc::clone(&deps.connection),
                deps.launcher,
            )),
        };

        Ok(Self {
            queue,
            config,
            connection: deps.connection,
            metrics: deps.metrics,
            error_handler: deps.error_handler,
            strategy,
            state: PollerState::new(),
        })
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }

    pub fn last_poll_time(&self) -> Instant {
        self.state.last_poll_time()
    }

    pub fn isolation_mode(&self) -> IsolationMode {
        self.strategy.mode()
    }

    /// Run the poll loop until shutdown is observed
    ///
    /// Returns immediately if shutdown was already requested.
    #[instrument(skip(self), fields(namespace = %self.queue.namespace, task_queue = %self.queue.task_queue))]
    pub async fn start(&self) -> Result<(), PollerError> {
        match self.state.begin_running() {
            Lifecycle::Idle => {}
            Lifecycle::Running => return Err(PollerError::AlreadyRunning),
            Lifecycle::ShuttingDown => {
                debug!("Shutdown requested before start; not polling");
                return Ok(());
            }
        }

        let _active = ActiveLoop(&self.state.loop_active);
        info!(mode = %self.strategy.mode(), "Starting activity poller");
        self.poll_loop().await;
        debug!("Activity poller loop exited");
        Ok(())
    }

    /// Request shutdown; the loop exits at the top of its next iteration
    pub fn stop_polling(&self) {
        if self.state.request_shutdown() != Lifecycle::ShuttingDown {
            info!(
                namespace = %self.queue.namespace,
                task_queue = %self.queue.task_queue,
                "Shutting down activity poller"
            );
        }
    }

    /// Cancel this poller's long poll, if one is in flight
    pub fn cancel_pending_requests(&self) {
        self.connection.cancel_pending_poll(&self.queue);
    }

    /// Wait for the loop to exit, then drain and release the execution strategy
    pub async fn wait(&self) -> Result<(), PollerError> {
        if !self.state.is_shutting_down() {
            error!(
                namespace = %self.queue.namespace,
                task_queue = %self.queue.task_queue,
                lifecycle = %self.lifecycle(),
                "Activity poller waiting for shutdown completion without being in shutting_down state"
            );
            return Err(PollerError::WaitBeforeShutdown);
        }

        let mut active = self.state.loop_active.subscribe();
        // the sender lives in `self`, so this only returns once the loop is inactive
        let _ = active.wait_for(|running| !*running).await;

        self.strategy.release().await;
        debug!(
            namespace = %self.queue.namespace,
            task_queue = %self.queue.task_queue,
            "Activity poller shut down"
        );
        Ok(())
    }

    async fn poll_loop(&self) {
        let tags = MetricTags::for_queue(&self.queue);
        // idle time before start is not a gap between polls
        self.state.touch();

        loop {
            if self.state.is_shutting_down() {
                break;
            }

            let since_last = self.state.last_poll_time().elapsed();
            self.metrics
                .timing(keys::TIME_SINCE_LAST_POLL, since_last, &tags);

            let task = self.poll_for_task().await;
            self.state.touch();

            let Some(task) = task else {
                continue;
            };

            let received = !task.is_empty();
            self.metrics.increment(
                keys::POLL_COMPLETED,
                &tags.clone().with("received_task", received.to_string()),
            );
            if !received {
                continue;
            }

            self.dispatch(task).await;
        }
    }

    async fn poll_for_task(&self) -> Option<ActivityTask> {
        debug!(
            namespace = %self.queue.namespace,
            task_queue = %self.queue.task_queue,
            "Polling activity task queue"
        );

        // a cancel issued before the poll went out would be missed by the connection
        let polled = tokio::select! {
            biased;
            _ = self.state.shutdown.cancelled() => return None,
            polled = self.connection.poll_activity_task(&self.queue) => polled,
        };

        match polled {
            Ok(task) => Some(task),
            // logged by whoever requested shutdown
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                let err = PollerError::from(e);
                error!(
                    namespace = %self.queue.namespace,
                    task_queue = %self.queue.task_queue,
                    error = %err,
                    "Unable to poll activity task queue"
                );
                self.error_handler.handle(&err, &self.queue);
                self.retry_delay().await;
                None
            }
        }
    }

    async fn retry_delay(&self) {
        let delay = self.config.poll_retry_delay;
        if delay == Duration::ZERO {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.state.shutdown.cancelled() => {}
        }
    }

    async fn dispatch(&self, task: ActivityTask) {
        let activity_type = task.activity_type.clone();
        if let Err(e) = self.strategy.dispatch(task).await {
            let err = PollerError::from(e);
            error!(
                namespace = %self.queue.namespace,
                task_queue = %self.queue.task_queue,
                activity_type = ?activity_type,
                error = %err,
                "Unable to dispatch activity task"
            );
            self.error_handler.handle(&err, &self.queue);
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMetrics, RecordingProcessor, ScriptedConnection};

    fn poller(connection: Arc<ScriptedConnection>, config: PollerConfig) -> Poller {
        let deps = PollerDeps::new(connection, Arc::new(RecordingProcessor::new()))
            .with_metrics(Arc::new(RecordingMetrics::new()));
        Poller::new(
            QueueId::new("default", "unit"),
            Arc::new(ActivityLookup::new()),
            vec![],
            config,
            deps,
        )
        .unwrap()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let state = PollerState::new();
        assert_eq!(state.lifecycle(), Lifecycle::Idle);

        assert_eq!(state.begin_running(), Lifecycle::Idle);
        assert_eq!(state.lifecycle(), Lifecycle::Running);
        assert!(*state.loop_active.borrow());

        assert_eq!(state.begin_running(), Lifecycle::Running);
        assert_eq!(state.request_shutdown(), Lifecycle::Running);
        assert_eq!(state.request_shutdown(), Lifecycle::ShuttingDown);
        assert_eq!(state.begin_running(), Lifecycle::ShuttingDown);
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_before_stop_fails() {
        let poller = poller(Arc::new(ScriptedConnection::new(vec![])), PollerConfig::new());

        let err = poller.wait().await.unwrap_err();
        assert!(matches!(err, PollerError::WaitBeforeShutdown));
        assert_eq!(poller.lifecycle(), Lifecycle::Idle);
    }

    #[tokio::test]
    async fn test_start_after_stop_does_not_poll() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let poller = poller(Arc::clone(&connection), PollerConfig::new());

        poller.stop_polling();
        poller.start().await.unwrap();
        poller.wait().await.unwrap();

        assert_eq!(connection.polls(), 0);
        assert_eq!(poller.lifecycle(), Lifecycle::ShuttingDown);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let poller = Arc::new(poller(Arc::clone(&connection), PollerConfig::new()));

        let running = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.start().await })
        };
        while connection.polls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            poller.start().await,
            Err(PollerError::AlreadyRunning)
        ));

        poller.stop_polling();
        poller.cancel_pending_requests();
        poller.wait().await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(connection.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_gap_starts_at_loop_start() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let metrics = Arc::new(RecordingMetrics::new());
        let deps = PollerDeps::new(connection.clone(), Arc::new(RecordingProcessor::new()))
            .with_metrics(metrics.clone());
        let poller = Arc::new(
            Poller::new(
                QueueId::new("default", "unit"),
                Arc::new(ActivityLookup::new()),
                vec![],
                PollerConfig::new(),
                deps,
            )
            .unwrap(),
        );

        tokio::time::sleep(Duration::from_secs(600)).await;
        let running = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.start().await })
        };
        while connection.polls() == 0 {
            tokio::task::yield_now().await;
        }

        let first = metrics
            .events()
            .into_iter()
            .find(|e| e.key == keys::TIME_SINCE_LAST_POLL)
            .and_then(|e| e.timing)
            .unwrap();
        assert!(first < Duration::from_secs(1), "first gap was {first:?}");

        poller.stop_polling();
        poller.cancel_pending_requests();
        poller.wait().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_alone_unblocks_a_parked_poll() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let poller = Arc::new(poller(Arc::clone(&connection), PollerConfig::new()));
        let running = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.start().await })
        };
        while connection.polls() == 0 {
            tokio::task::yield_now().await;
        }

        poller.stop_polling();
        tokio::time::timeout(Duration::from_secs(5), poller.wait())
            .await
            .unwrap()
            .unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(connection.cancel_requests(), 0);
        assert_eq!(connection.polls(), 1);
    }

    #[test]
    fn test_strategy_follows_isolation_mode() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let isolated = poller(
            Arc::clone(&connection),
            PollerConfig::new().with_isolation_mode(IsolationMode::IsolatedProcess),
        );
        let in_process = poller(connection, PollerConfig::new());

        assert_eq!(isolated.isolation_mode(), IsolationMode::IsolatedProcess);
        assert_eq!(in_process.isolation_mode(), IsolationMode::InProcess);
    }
}
