//! Heartbeat scheduling
//!
//! A [`HeartbeatPool`] runs periodic callbacks that report liveness/progress
//! for in-flight executions. At most `size` callbacks run at the same time;
//! timers waiting for a free worker simply fire late.
//!
//! Pools are owned by exactly one scope: the in-process strategy of a poller
//! (size = concurrency) or one isolated child process (size 1). After
//! [`HeartbeatPool::release`] no timer fires and new scheduling is rejected.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::task::QueueId;

type HeartbeatCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Error from heartbeat scheduling
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeartbeatError {
    /// The pool has been released
    #[error("heartbeat pool has been released")]
    Released,

    /// Interval must be non-zero
    #[error("heartbeat interval must be greater than zero")]
    InvalidInterval,

    /// Scheduling requires a running tokio runtime
    #[error("no tokio runtime available for heartbeat timers")]
    NoRuntime,
}

#[derive(Default)]
struct Timers {
    released: bool,
    handles: Vec<JoinHandle<()>>,
}

/// Bounded pool of heartbeat timer workers
pub struct HeartbeatPool {
    queue: QueueId,
    size: usize,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    timers: Mutex<Timers>,
}

impl HeartbeatPool {
    /// Create a pool running at most `size` callbacks concurrently
    pub fn new(size: usize, queue: QueueId) -> Self {
        let size = size.max(1);
        debug!(
            namespace = %queue.namespace,
            task_queue = %queue.task_queue,
            size,
            "Creating heartbeat pool"
        );

        Self {
            queue,
            size,
            workers: Arc::new(Semaphore::new(size)),
            shutdown: CancellationToken::new(),
            timers: Mutex::new(Timers::default()),
        }
    }

    /// Number of timer workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue this pool reports for
    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    /// Whether [`release`](Self::release) has been called
    pub fn is_released(&self) -> bool {
        self.timers.lock().released
    }

    /// Number of timers that have not finished yet
    pub fn active_timers(&self) -> usize {
        self.timers
            .lock()
            .handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Run `callback` every `interval` until the returned handle is cancelled
    /// or the pool is released
    ///
    /// The first run happens one full interval after scheduling.
    pub fn schedule_periodic<F, Fut>(
        &self,
        key: impl Into<String>,
        interval: Duration,
        callback: F,
    ) -> Result<HeartbeatHandle, HeartbeatError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(HeartbeatError::InvalidInterval);
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| HeartbeatError::NoRuntime)?;
        let callback: HeartbeatCallback = Arc::new(move || callback().boxed());
        let key = key.into();

        let mut timers = self.timers.lock();
        if timers.released {
            return Err(HeartbeatError::Released);
        }
        timers.handles.retain(|handle| !handle.is_finished());

        let token = self.shutdown.child_token();
        let handle = HeartbeatHandle {
            key: key.clone(),
            token: token.clone(),
        };
        let workers = Arc::clone(&self.workers);

        timers.handles.push(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let permit = tokio::select! {
                            _ = token.cancelled() => break,
                            permit = workers.acquire() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };

                        trace!(key = %key, "Heartbeat tick");
                        callback().await;
                        drop(permit);
                    }
                }
            }

            trace!(key = %key, "Heartbeat timer stopped");
        }));

        Ok(handle)
    }

    /// Stop every timer and reject further scheduling
    ///
    /// Waits for callbacks that are already running to return. Idempotent.
    pub async fn release(&self) {
        let handles = {
            let mut timers = self.timers.lock();
            if timers.released {
                return;
            }
            timers.released = true;
            self.shutdown.cancel();
            std::mem::take(&mut timers.handles)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(
                        namespace = %self.queue.namespace,
                        task_queue = %self.queue.task_queue,
                        "Heartbeat callback panicked"
                    );
                }
            }
        }

        self.workers.close();

        debug!(
            namespace = %self.queue.namespace,
            task_queue = %self.queue.task_queue,
            "Heartbeat pool released"
        );
    }
}

impl std::fmt::Debug for HeartbeatPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatPool")
            .field("queue", &self.queue)
            .field("size", &self.size)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Handle to a scheduled heartbeat timer
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    key: String,
    token: CancellationToken,
}

impl HeartbeatHandle {
    /// Stop this timer
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer was cancelled (directly or by pool release)
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Key the timer was scheduled under
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Heartbeat access for a single execution
///
/// Every timer scheduled through the scope is cancelled when the scope is
/// dropped, i.e. when the execution context goes away.
pub struct HeartbeatScope {
    pool: Arc<HeartbeatPool>,
    handles: Mutex<Vec<HeartbeatHandle>>,
}

impl HeartbeatScope {
    /// Create a scope over a pool
    pub fn new(pool: Arc<HeartbeatPool>) -> Self {
        Self {
            pool,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Schedule a periodic callback bound to this execution
    pub fn every<F, Fut>(
        &self,
        key: impl Into<String>,
        interval: Duration,
        callback: F,
    ) -> Result<HeartbeatHandle, HeartbeatError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.pool.schedule_periodic(key, interval, callback)?;
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<HeartbeatPool> {
        &self.pool
    }
}

impl Drop for HeartbeatScope {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for HeartbeatScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatScope")
            .field("pool", &self.pool)
            .field("timers", &self.handles.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(size: usize) -> Arc<HeartbeatPool> {
        Arc::new(HeartbeatPool::new(size, QueueId::new("default", "heartbeats")))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() -> futures::future::Ready<()> + Send + Sync {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_callback_fires_each_interval() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.schedule_periodic("task-1", Duration::from_secs(10), counting(&counter))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.active_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_handle_stops_timer() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = pool
            .schedule_periodic("task-1", Duration::from_secs(10), counting(&counter))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());
        assert_eq!(handle.key(), "task-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_timers_and_rejects_scheduling() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = pool
            .schedule_periodic("task-1", Duration::from_secs(10), counting(&counter))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        pool.release().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(handle.is_cancelled());
        assert!(pool.is_released());
        assert_eq!(pool.active_timers(), 0);

        let err = pool
            .schedule_periodic("task-2", Duration::from_secs(10), counting(&counter))
            .unwrap_err();
        assert_eq!(err, HeartbeatError::Released);

        // second release is a no-op
        pool.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_size_bounds_concurrent_callbacks() {
        let pool = pool(1);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            pool.schedule_periodic(key, Duration::from_secs(10), move || {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(45)).await;
        pool.release().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let err = pool
            .schedule_periodic("task-1", Duration::ZERO, counting(&counter))
            .unwrap_err();
        assert_eq!(err, HeartbeatError::InvalidInterval);
    }

    #[test]
    fn test_schedule_without_runtime() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let err = pool
            .schedule_periodic("task-1", Duration::from_secs(1), counting(&counter))
            .unwrap_err();
        assert_eq!(err, HeartbeatError::NoRuntime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_drop_cancels_its_timers() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let scope = HeartbeatScope::new(Arc::clone(&pool));
        let handle = scope
            .every("task-1", Duration::from_secs(10), counting(&counter))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        drop(scope);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(handle.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!pool.is_released());
    }
}
