// Process-isolated execution
// Decision: One forked process per task; the parent waits for it before the next poll, so a
//           crash in one task cannot take down the poller or later tasks
// Decision: fork/wait/exit sit behind ProcessLauncher so the dispatch protocol can be
//           exercised without forking the test process
// Decision: The child builds its own current-thread runtime; runtime worker threads of the
//           parent do not exist after fork
// Decision: fork runs on a blocking thread of a multi-threaded runtime, so the child inherits
//           every lock another parent thread held at that instant (log writer, sink mutexes).
//           The child reinitializes the connection before touching anything else; processors
//           used with isolation must not share locks with threads that keep running in the parent

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{ExecutionEnv, ExecutionStrategy};
use crate::config::IsolationMode;
use crate::connection::Connection;
use crate::error::DispatchError;
use crate::heartbeat::HeartbeatPool;
use crate::processor::ChildExit;
use crate::task::ActivityTask;

// The connection may be shared by several pollers; only one quiesce/fork/resume runs at a time.
static FORK_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Which side of a fork the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// Original process; `pid` is the new child
    Parent { pid: i32 },
    /// The duplicate
    Child,
}

/// Process duplication primitives
pub trait ProcessLauncher: Send + Sync {
    /// Duplicate the current process
    fn fork(&self) -> io::Result<Forked>;

    /// Block until `pid` terminates
    fn wait(&self, pid: i32) -> io::Result<ChildExit>;

    /// Terminate the child without running the parent's cleanup
    fn exit_child(&self, code: i32) -> !;
}

/// `fork(2)` / `waitpid(2)` / `_exit(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkLauncher;

#[cfg(unix)]
impl ProcessLauncher for ForkLauncher {
    fn fork(&self) -> io::Result<Forked> {
        // SAFETY: the child only runs the isolated-execution path, which builds fresh
        // runtime state and leaves through `_exit`.
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(Forked::Child),
            pid => Ok(Forked::Parent { pid }),
        }
    }

    fn wait(&self, pid: i32) -> io::Result<ChildExit> {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: `status` is a valid out-pointer for the duration of the call.
            let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
            if rc != -1 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if libc::WIFEXITED(status) {
            Ok(ChildExit::from_code(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Ok(ChildExit::Signaled(libc::WTERMSIG(status)))
        } else {
            Ok(ChildExit::Exited(status))
        }
    }

    fn exit_child(&self, code: i32) -> ! {
        // SAFETY: `_exit` never returns and skips atexit handlers inherited from the parent.
        unsafe { libc::_exit(code) }
    }
}

#[cfg(not(unix))]
impl ProcessLauncher for ForkLauncher {
    fn fork(&self) -> io::Result<Forked> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fork is not available on this platform",
        ))
    }

    fn wait(&self, _pid: i32) -> io::Result<ChildExit> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fork is not available on this platform",
        ))
    }

    fn exit_child(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

/// Runs each task in its own forked process, one at a time
pub struct IsolatedProcessStrategy {
    env: Arc<ExecutionEnv>,
    connection: Arc<dyn Connection>,
    launcher: Arc<dyn ProcessLauncher>,
    serial: tokio::sync::Mutex<()>,
    spawned: Arc<AtomicU64>,
}

impl IsolatedProcessStrategy {
    /// Create a strategy forking through `launcher`
    pub fn new(
        env: Arc<ExecutionEnv>,
        connection: Arc<dyn Connection>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            env,
            connection,
            launcher,
            serial: tokio::sync::Mutex::new(()),
            spawned: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of isolated processes started so far
    pub fn processes_spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionStrategy for IsolatedProcessStrategy {
    async fn dispatch(&self, task: ActivityTask) -> Result<(), DispatchError> {
        let _serial = self.serial.lock().await;

        let env = Arc::clone(&self.env);
        let connection = Arc::clone(&self.connection);
        let launcher = Arc::clone(&self.launcher);
        let spawned = Arc::clone(&self.spawned);
        let reported = task.clone();

        let exit = tokio::task::spawn_blocking(move || {
            fork_and_wait(&env, connection.as_ref(), launcher.as_ref(), &spawned, task)
        })
        .await
        .map_err(|e| DispatchError::Join(e.to_string()))??;

        if exit.is_abnormal() {
            self.env
                .processor
                .report_abnormal_exit(&self.env.queue, &reported, exit)
                .await;
        }

        Ok(())
    }

    async fn release(&self) {
        // a dispatch still waiting on its child holds the lock
        let _serial = self.serial.lock().await;
        debug!(
            namespace = %self.env.queue.namespace,
            task_queue = %self.env.queue.task_queue,
            processes = self.processes_spawned(),
            "Isolated execution released"
        );
    }

    fn mode(&self) -> IsolationMode {
        IsolationMode::IsolatedProcess
    }
}

impl std::fmt::Debug for IsolatedProcessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedProcessStrategy")
            .field("queue", &self.env.queue)
            .field("processes_spawned", &self.processes_spawned())
            .finish()
    }
}

fn fork_and_wait(
    env: &ExecutionEnv,
    connection: &dyn Connection,
    launcher: &dyn ProcessLauncher,
    spawned: &AtomicU64,
    task: ActivityTask,
) -> Result<ChildExit, DispatchError> {
    info!(
        namespace = %env.queue.namespace,
        task_queue = %env.queue.task_queue,
        activity_type = ?task.activity_type,
        "Forking to run activity"
    );

    let pid = {
        let _fork_guard = FORK_LOCK.lock();
        connection.prepare_for_duplication();

        match launcher.fork() {
            Ok(Forked::Child) => {
                connection.reinitialize_after_duplication_as_child();
                let code = run_isolated_child(env, task);
                launcher.exit_child(code)
            }
            Ok(Forked::Parent { pid }) => {
                connection.resume_after_duplication_as_parent();
                spawned.fetch_add(1, Ordering::Relaxed);
                pid
            }
            Err(e) => {
                connection.resume_after_duplication_as_parent();
                error!(
                    namespace = %env.queue.namespace,
                    task_queue = %env.queue.task_queue,
                    error = %e,
                    "Unable to fork isolated worker process"
                );
                if e.kind() == io::ErrorKind::Unsupported {
                    return Err(DispatchError::Unsupported);
                }
                return Err(DispatchError::Fork(e));
            }
        }
    };

    info!(pid, "Waiting on forked process");
    let exit = launcher
        .wait(pid)
        .map_err(|source| DispatchError::Wait { pid, source })?;

    if exit.is_abnormal() {
        warn!(pid, exit = %exit, "Forked process ended abnormally");
    } else {
        info!(pid, exit = %exit, "Forked process done");
    }

    Ok(exit)
}

/// Body of an isolated worker process
///
/// Runs one task on a private runtime with a single-worker heartbeat pool,
/// releases the pool and returns the exit code the process should use.
pub fn run_isolated_child(env: &ExecutionEnv, task: ActivityTask) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Unable to build runtime in isolated worker process");
            return ChildExit::SETUP_FAILURE_CODE;
        }
    };

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            let heartbeats = Arc::new(HeartbeatPool::new(1, env.queue.clone()));
            let ctx = env.context(task, Arc::clone(&heartbeats));
            let outcome = env.processor.process(ctx).await;
            heartbeats.release().await;
            ChildExit::code_for(&outcome)
        })
    }));

    match result {
        Ok(code) => code,
        Err(_) => {
            error!(
                namespace = %env.queue.namespace,
                task_queue = %env.queue.task_queue,
                "Activity processing panicked in isolated worker process"
            );
            ChildExit::PANIC_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::ActivityLookup;
    use crate::processor::{ExecutionContext, ProcessOutcome, TaskProcessor};
    use crate::task::QueueId;
    use crate::testing::{
        Journal, JournalEntry, RecordingLauncher, RecordingProcessor, ScriptedConnection,
    };

    fn env(processor: Arc<dyn TaskProcessor>) -> Arc<ExecutionEnv> {
        Arc::new(ExecutionEnv {
            queue: QueueId::new("default", "isolated"),
            lookup: Arc::new(ActivityLookup::new()),
            middleware: vec![],
            processor,
        })
    }

    struct Panics;

    #[async_trait]
    impl TaskProcessor for Panics {
        async fn process(&self, _ctx: ExecutionContext) -> ProcessOutcome {
            panic!("activity blew up");
        }
    }

    struct Fails;

    #[async_trait]
    impl TaskProcessor for Fails {
        async fn process(&self, ctx: ExecutionContext) -> ProcessOutcome {
            assert_eq!(ctx.heartbeats().pool().size(), 1);
            ProcessOutcome::failed("business failure")
        }
    }

    #[test]
    fn test_child_exit_code_for_completed_task() {
        let processor = Arc::new(RecordingProcessor::new());
        let env = env(processor.clone());

        let code = run_isolated_child(&env, ActivityTask::new("a", serde_json::Value::Null));

        assert_eq!(code, ChildExit::SUCCESS_CODE);
        assert_eq!(processor.completed(), 1);
    }

    #[test]
    fn test_child_exit_code_for_failed_task() {
        let env = env(Arc::new(Fails));
        let code = run_isolated_child(&env, ActivityTask::new("a", serde_json::Value::Null));
        assert_eq!(code, ChildExit::FAILURE_CODE);
    }

    #[test]
    fn test_child_exit_code_for_panic() {
        let env = env(Arc::new(Panics));
        let code = run_isolated_child(&env, ActivityTask::new("a", serde_json::Value::Null));
        assert_eq!(code, ChildExit::PANIC_CODE);
    }

    #[tokio::test]
    async fn test_dispatch_runs_fork_protocol_in_order() {
        let journal = Journal::default();
        let connection = Arc::new(ScriptedConnection::new(vec![]).with_journal(journal.clone()));
        let launcher = Arc::new(RecordingLauncher::new().with_journal(journal.clone()));
        let strategy = IsolatedProcessStrategy::new(
            env(Arc::new(RecordingProcessor::new())),
            connection,
            launcher.clone(),
        );

        strategy
            .dispatch(ActivityTask::new("a", serde_json::Value::Null))
            .await
            .unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                JournalEntry::PrepareForDuplication,
                JournalEntry::Fork { pid: 1000 },
                JournalEntry::ResumeAsParent,
                JournalEntry::Wait { pid: 1000 },
            ]
        );
        assert_eq!(strategy.processes_spawned(), 1);
        assert_eq!(launcher.max_alive(), 1);
    }

    #[tokio::test]
    async fn test_abnormal_exit_is_reported() {
        let processor = Arc::new(RecordingProcessor::new());
        let launcher = Arc::new(RecordingLauncher::new().with_exit(ChildExit::Signaled(9)));
        let strategy = IsolatedProcessStrategy::new(
            env(processor.clone()),
            Arc::new(ScriptedConnection::new(vec![])),
            launcher,
        );

        strategy
            .dispatch(ActivityTask::new("crashy", serde_json::Value::Null))
            .await
            .unwrap();

        let reports = processor.abnormal_exits();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.activity_type.as_deref(), Some("crashy"));
        assert_eq!(reports[0].1, ChildExit::Signaled(9));
    }

    #[tokio::test]
    async fn test_business_failure_is_not_reported_again() {
        let processor = Arc::new(RecordingProcessor::new());
        let launcher = Arc::new(RecordingLauncher::new().with_exit(ChildExit::Failed));
        let strategy = IsolatedProcessStrategy::new(
            env(processor.clone()),
            Arc::new(ScriptedConnection::new(vec![])),
            launcher,
        );

        strategy
            .dispatch(ActivityTask::new("a", serde_json::Value::Null))
            .await
            .unwrap();

        assert!(processor.abnormal_exits().is_empty());
    }

    #[tokio::test]
    async fn test_fork_failure_still_resumes_parent() {
        let journal = Journal::default();
        let connection = Arc::new(ScriptedConnection::new(vec![]).with_journal(journal.clone()));
        let launcher = Arc::new(
            RecordingLauncher::new()
                .with_journal(journal.clone())
                .failing_fork(),
        );
        let strategy = IsolatedProcessStrategy::new(
            env(Arc::new(RecordingProcessor::new())),
            connection,
            launcher,
        );

        let err = strategy
            .dispatch(ActivityTask::new("a", serde_json::Value::Null))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Fork(_)));
        assert_eq!(
            journal.entries(),
            vec![
                JournalEntry::PrepareForDuplication,
                JournalEntry::ResumeAsParent,
            ]
        );
        assert_eq!(strategy.processes_spawned(), 0);
    }

    #[tokio::test]
    async fn test_process_is_counted_even_when_wait_fails() {
        let processor = Arc::new(RecordingProcessor::new());
        let strategy = IsolatedProcessStrategy::new(
            env(processor.clone()),
            Arc::new(ScriptedConnection::new(vec![])),
            Arc::new(RecordingLauncher::new().failing_wait()),
        );

        let err = strategy
            .dispatch(ActivityTask::new("a", serde_json::Value::Null))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Wait { pid: 1000, .. }));
        assert_eq!(strategy.processes_spawned(), 1);
        assert!(processor.abnormal_exits().is_empty());
    }
}
