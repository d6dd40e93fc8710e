//! In-memory fakes for driving a poller without a server
//!
//! Used by this crate's own tests and available to downstream crates that
//! want to exercise their activities through the real poll loop.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::connection::{Connection, ConnectionError, ForkSafety};
use crate::error::{ErrorHandler, PollerError};
use crate::metrics::{keys, MetricTags, MetricsSink};
use crate::processor::{ChildExit, ExecutionContext, ProcessOutcome, TaskProcessor};
use crate::strategy::{Forked, ProcessLauncher};
use crate::task::{ActivityTask, QueueId};

/// Something that happened at a fake's boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Poll,
    PrepareForDuplication,
    ResumeAsParent,
    ReinitializeAsChild,
    Fork { pid: i32 },
    Wait { pid: i32 },
}

/// Ordered record shared between fakes
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    pub fn record(&self, entry: JournalEntry) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &JournalEntry) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }
}

/// Connection replaying a fixed script of poll responses
///
/// Once the script is exhausted a poll parks like a real long poll until
/// [`Connection::cancel_pending_poll`] is called for its queue, then returns
/// [`ConnectionError::Cancelled`]. The script is shared by every queue.
#[derive(Debug, Default)]
pub struct ScriptedConnection {
    script: Mutex<VecDeque<Result<ActivityTask, ConnectionError>>>,
    polls: AtomicUsize,
    cancels: AtomicUsize,
    cancelled: Mutex<HashMap<QueueId, Arc<Notify>>>,
    journal: Option<Journal>,
}

impl ScriptedConnection {
    pub fn new(script: Vec<Result<ActivityTask, ConnectionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Append a response to the script
    pub fn push(&self, response: Result<ActivityTask, ConnectionError>) {
        self.script.lock().push_back(response);
    }

    /// Polls issued so far
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Calls to `cancel_pending_poll`
    pub fn cancel_requests(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Responses not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }

    fn cancellation(&self, queue: &QueueId) -> Arc<Notify> {
        Arc::clone(self.cancelled.lock().entry(queue.clone()).or_default())
    }
}

impl ForkSafety for ScriptedConnection {
    fn prepare_for_duplication(&self) {
        self.record(JournalEntry::PrepareForDuplication);
    }

    fn resume_after_duplication_as_parent(&self) {
        self.record(JournalEntry::ResumeAsParent);
    }

    fn reinitialize_after_duplication_as_child(&self) {
        self.record(JournalEntry::ReinitializeAsChild);
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn poll_activity_task(&self, queue: &QueueId) -> Result<ActivityTask, ConnectionError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.record(JournalEntry::Poll);

        let next = self.script.lock().pop_front();
        match next {
            Some(response) => response,
            None => {
                self.cancellation(queue).notified().await;
                Err(ConnectionError::Cancelled)
            }
        }
    }

    fn cancel_pending_poll(&self, queue: &QueueId) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancellation(queue).notify_one();
    }
}

/// One recorded metric emission
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub key: &'static str,
    pub tags: MetricTags,
    pub timing: Option<Duration>,
}

/// Metrics sink keeping every emission in memory
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Completed polls with the given `received_task` tag
    pub fn polls_completed(&self, received_task: bool) -> usize {
        let expected = received_task.to_string();
        self.events
            .lock()
            .iter()
            .filter(|e| {
                e.key == keys::POLL_COMPLETED && e.tags.get("received_task") == Some(expected.as_str())
            })
            .count()
    }

    /// Timing samples recorded under `key`
    pub fn timings(&self, key: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.key == key && e.timing.is_some())
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn timing(&self, key: &'static str, value: Duration, tags: &MetricTags) {
        self.events.lock().push(MetricEvent {
            key,
            tags: tags.clone(),
            timing: Some(value),
        });
    }

    fn increment(&self, key: &'static str, tags: &MetricTags) {
        self.events.lock().push(MetricEvent {
            key,
            tags: tags.clone(),
            timing: None,
        });
    }
}

/// Task processor recording what it was asked to run
///
/// By default every task completes with `null`. A gated processor holds
/// each execution until a permit is added to the returned gate. An
/// executing processor runs the registered activity through the
/// middleware chain.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    started: Mutex<Vec<String>>,
    outcomes: Mutex<Vec<ProcessOutcome>>,
    abnormal: Mutex<Vec<(ActivityTask, ChildExit)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    completed: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    execute: bool,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor whose executions each wait for one permit on the gate
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (Arc::new(processor), gate)
    }

    /// Processor that runs the resolved activity
    pub fn executing() -> Self {
        Self {
            execute: true,
            ..Self::default()
        }
    }

    /// Activity types in the order executions started
    pub fn started_types(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<ProcessOutcome> {
        self.outcomes.lock().clone()
    }

    pub fn abnormal_exits(&self) -> Vec<(ActivityTask, ChildExit)> {
        self.abnormal.lock().clone()
    }

    /// Highest number of simultaneous executions seen
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskProcessor for RecordingProcessor {
    async fn process(&self, ctx: ExecutionContext) -> ProcessOutcome {
        self.started
            .lock()
            .push(ctx.activity_type().unwrap_or_default().to_string());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let outcome = if self.execute {
            ctx.execute_activity().await
        } else {
            ProcessOutcome::Completed(serde_json::Value::Null)
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().push(outcome.clone());
        outcome
    }

    async fn report_abnormal_exit(&self, _queue: &QueueId, task: &ActivityTask, exit: ChildExit) {
        self.abnormal.lock().push((task.clone(), exit));
    }
}

/// Launcher that pretends to fork
///
/// Every fork yields a parent with a fresh pid starting at 1000; the child
/// side never runs. Waits return the configured exit.
#[derive(Debug)]
pub struct RecordingLauncher {
    next_pid: AtomicI32,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    exit: ChildExit,
    fail_fork: bool,
    fail_wait: bool,
    journal: Option<Journal>,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            alive: AtomicUsize::new(0),
            max_alive: AtomicUsize::new(0),
            exit: ChildExit::Succeeded,
            fail_fork: false,
            fail_wait: false,
            journal: None,
        }
    }
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Exit every simulated child reports
    pub fn with_exit(mut self, exit: ChildExit) -> Self {
        self.exit = exit;
        self
    }

    /// Make every fork fail
    pub fn failing_fork(mut self) -> Self {
        self.fail_fork = true;
        self
    }

    /// Make every wait fail after the fork succeeded
    pub fn failing_wait(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    /// Highest number of simulated children alive at once
    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }

    /// Simulated children started
    pub fn forks(&self) -> usize {
        (self.next_pid.load(Ordering::SeqCst) - 1000) as usize
    }

    fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn fork(&self) -> io::Result<Forked> {
        if self.fail_fork {
            return Err(io::Error::other("fork refused"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_alive.fetch_max(alive, Ordering::SeqCst);
        self.record(JournalEntry::Fork { pid });
        Ok(Forked::Parent { pid })
    }

    fn wait(&self, pid: i32) -> io::Result<ChildExit> {
        self.record(JournalEntry::Wait { pid });
        self.alive.fetch_sub(1, Ordering::SeqCst);
        if self.fail_wait {
            return Err(io::Error::other("no such child"));
        }
        Ok(self.exit)
    }

    fn exit_child(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

/// Error handler keeping the rendered errors it received
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    errors: Mutex<Vec<(String, QueueId)>>,
}

impl RecordingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn handle(&self, error: &PollerError, queue: &QueueId) {
        self.errors.lock().push((error.to_string(), queue.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connection_parks_until_cancelled() {
        let connection = Arc::new(ScriptedConnection::new(vec![Ok(ActivityTask::empty())]));
        let queue = QueueId::new("default", "q");

        assert!(connection.poll_activity_task(&queue).await.unwrap().is_empty());

        let parked = {
            let connection = Arc::clone(&connection);
            let queue = queue.clone();
            tokio::spawn(async move { connection.poll_activity_task(&queue).await })
        };
        tokio::task::yield_now().await;
        connection.cancel_pending_poll(&queue);

        assert_eq!(parked.await.unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(connection.polls(), 2);
        assert_eq!(connection.cancel_requests(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_wakes_the_named_queue() {
        let connection = Arc::new(ScriptedConnection::new(vec![]));
        let parked = |queue: QueueId| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.poll_activity_task(&queue).await })
        };
        let first = QueueId::new("default", "first");
        let second = QueueId::new("default", "second");
        let first_poll = parked(first.clone());
        let second_poll = parked(second.clone());
        while connection.polls() < 2 {
            tokio::task::yield_now().await;
        }

        connection.cancel_pending_poll(&first);
        assert_eq!(first_poll.await.unwrap(), Err(ConnectionError::Cancelled));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!second_poll.is_finished());

        connection.cancel_pending_poll(&second);
        assert_eq!(second_poll.await.unwrap(), Err(ConnectionError::Cancelled));
    }

    #[test]
    fn test_recording_metrics_filters_by_tag() {
        let metrics = RecordingMetrics::new();
        let tags = MetricTags::for_queue(&QueueId::new("default", "q"));

        metrics.increment(keys::POLL_COMPLETED, &tags.clone().with("received_task", "false"));
        metrics.increment(keys::POLL_COMPLETED, &tags.clone().with("received_task", "true"));
        metrics.increment(keys::POLL_COMPLETED, &tags.clone().with("received_task", "false"));
        metrics.timing(keys::TIME_SINCE_LAST_POLL, Duration::from_millis(3), &tags);

        assert_eq!(metrics.polls_completed(false), 2);
        assert_eq!(metrics.polls_completed(true), 1);
        assert_eq!(metrics.timings(keys::TIME_SINCE_LAST_POLL), 1);
    }
}
