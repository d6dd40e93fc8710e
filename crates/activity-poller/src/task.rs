//! Queue identity and polled activity tasks

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a task queue: the `(namespace, task_queue)` pair a poller serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId {
    /// Namespace the queue belongs to
    pub namespace: String,

    /// Task queue name
    pub task_queue: String,
}

impl QueueId {
    /// Create a new queue identity
    pub fn new(namespace: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            task_queue: task_queue.into(),
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.task_queue)
    }
}

/// A unit of work returned by a long poll
///
/// A poll that times out server-side still returns a task, but without an
/// activity type. Such tasks are "empty" and are never dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Opaque token identifying the task to the remote endpoint
    #[serde(default)]
    pub task_token: Vec<u8>,

    /// Activity identifier within its workflow
    #[serde(default)]
    pub activity_id: String,

    /// Registered activity type to run; `None` when no work was available
    pub activity_type: Option<String>,

    /// Activity input
    #[serde(default)]
    pub input: serde_json::Value,

    /// Attempt number reported by the server (1-based)
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl ActivityTask {
    /// A task carrying no work (long poll expired server-side)
    pub fn empty() -> Self {
        Self {
            task_token: Vec::new(),
            activity_id: String::new(),
            activity_type: None,
            input: serde_json::Value::Null,
            attempt: first_attempt(),
        }
    }

    /// A task for the given activity type
    pub fn new(activity_type: impl Into<String>, input: serde_json::Value) -> Self {
        let activity_type = activity_type.into();
        Self {
            task_token: uuid::Uuid::now_v7().as_bytes().to_vec(),
            activity_id: activity_type.clone(),
            activity_type: Some(activity_type),
            input,
            attempt: first_attempt(),
        }
    }

    /// Set the activity id
    pub fn with_activity_id(mut self, id: impl Into<String>) -> Self {
        self.activity_id = id.into();
        self
    }

    /// Set the task token
    pub fn with_task_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.task_token = token.into();
        self
    }

    /// Whether this task carries an activity to run
    pub fn is_empty(&self) -> bool {
        self.activity_type.is_none()
    }
}
