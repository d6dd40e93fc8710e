//! Activity registry
//!
//! Maps activity type names to implementations. One "dynamic" activity may be
//! registered per queue to receive every type that has no explicit entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::processor::ExecutionContext;

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// An activity implementation
#[async_trait]
pub trait Activity: Send + Sync {
    /// Run the activity for one task
    async fn execute(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, ActivityError>;
}

/// Registration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LookupError {
    /// A dynamic activity was already registered for this lookup
    #[error("cannot register {name} dynamically; {previous} was already registered dynamically")]
    SecondDynamicActivity { name: String, previous: String },
}

#[derive(Clone)]
struct DynamicEntry {
    name: String,
    activity: Arc<dyn Activity>,
}

/// Registry of activities for one `(namespace, task_queue)` pair
#[derive(Clone, Default)]
pub struct ActivityLookup {
    activities: HashMap<String, Arc<dyn Activity>>,
    dynamic: Option<DynamicEntry>,
}

impl ActivityLookup {
    /// Create an empty lookup
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under a type name (replaces an earlier registration)
    pub fn add(&mut self, name: impl Into<String>, activity: Arc<dyn Activity>) {
        self.activities.insert(name.into(), activity);
    }

    /// Register the fallback activity for unknown type names
    pub fn add_dynamic(
        &mut self,
        name: impl Into<String>,
        activity: Arc<dyn Activity>,
    ) -> Result<(), LookupError> {
        let name = name.into();
        if let Some(existing) = &self.dynamic {
            return Err(LookupError::SecondDynamicActivity {
                name,
                previous: existing.name.clone(),
            });
        }
        self.dynamic = Some(DynamicEntry { name, activity });
        Ok(())
    }

    /// Find the activity for a type name, falling back to the dynamic activity
    pub fn find(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities
            .get(name)
            .or(self.dynamic.as_ref().map(|entry| &entry.activity))
            .cloned()
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the dynamic activity, if any
    pub fn dynamic_name(&self) -> Option<&str> {
        self.dynamic.as_ref().map(|entry| entry.name.as_str())
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty() && self.dynamic.is_none()
    }
}

impl fmt::Debug for ActivityLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityLookup")
            .field("activities", &self.names())
            .field("dynamic", &self.dynamic_name())
            .finish()
    }
}
