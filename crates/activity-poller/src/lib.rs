//! # Activity Poller
//!
//! Worker-side execution core of a task-queue client: long-polls a remote
//! queue for activity tasks and runs each one through a bounded execution
//! strategy, with cooperative shutdown, poll-failure retry and heartbeats.
//!
//! ## Features
//!
//! - **One poll loop per queue**: strictly sequential long polls, shutdown observed between iterations
//! - **In-process execution**: bounded worker pool; a saturated pool holds the poll loop back
//! - **Process isolation**: one forked process per task with a quiesce/resume protocol for the connection
//! - **Heartbeats**: pooled periodic callbacks scoped to a single execution
//! - **Pluggable boundaries**: connection, task processor, metrics sink and error handler are traits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (registrations per queue, starts and drains pollers)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Poller                              │
//! │  (long poll → metrics → dispatch, retry on failure)         │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │   Connection (external)   │  │     ExecutionStrategy         │
//! │   poll / cancel / fork    │  │  InProcess | IsolatedProcess  │
//! │   safety hooks            │  │  → TaskProcessor + heartbeats │
//! └───────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use activity_poller::prelude::*;
//!
//! let deps = PollerDeps::new(connection, processor);
//! let mut worker = Worker::new(deps, PollerConfig::from_env()?);
//! worker.register_activity(QueueId::new("default", "billing"), "charge", Arc::new(Charge));
//! worker.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod lookup;
pub mod metrics;
pub mod middleware;
pub mod poller;
pub mod processor;
pub mod strategy;
pub mod task;
pub mod telemetry;
pub mod testing;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{IsolationMode, PollerConfig};
    pub use crate::connection::{Connection, ConnectionError, ForkSafety};
    pub use crate::error::{DispatchError, ErrorHandler, IgnoreErrors, PollerError};
    pub use crate::heartbeat::{HeartbeatHandle, HeartbeatPool};
    pub use crate::lookup::{Activity, ActivityError, ActivityLookup};
    pub use crate::metrics::{LogMetrics, MetricsSink, OtelMetrics};
    pub use crate::middleware::Middleware;
    pub use crate::poller::{Lifecycle, Poller, PollerDeps};
    pub use crate::processor::{ExecutionContext, ProcessOutcome, TaskProcessor};
    pub use crate::task::{ActivityTask, QueueId};
    pub use crate::worker::Worker;
}

pub use config::{IsolationMode, PollerConfig};
pub use connection::{Connection, ConnectionError, ForkSafety};
pub use error::{DispatchError, ErrorHandler, PollerError};
pub use lookup::{Activity, ActivityError, ActivityLookup};
pub use poller::{Lifecycle, Poller, PollerDeps};
pub use processor::{ChildExit, ExecutionContext, ProcessOutcome, TaskProcessor};
pub use task::{ActivityTask, QueueId};
pub use worker::Worker;
