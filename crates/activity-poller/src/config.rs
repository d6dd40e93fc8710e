//! Poller configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of simultaneous executions in in-process mode
pub const DEFAULT_CONCURRENCY: usize = 20;

/// How a fetched task is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Run on a bounded worker pool inside the poller's process
    #[default]
    InProcess,

    /// Fork a dedicated process per task
    IsolatedProcess,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => write!(f, "in_process"),
            Self::IsolatedProcess => write!(f, "isolated_process"),
        }
    }
}

impl FromStr for IsolationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in_process" | "in-process" | "thread" => Ok(Self::InProcess),
            "isolated_process" | "isolated-process" | "fork" => Ok(Self::IsolatedProcess),
            other => Err(ConfigError::InvalidIsolationMode(other.to_string())),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Unknown isolation mode name
    #[error("unknown isolation mode: {0}")]
    InvalidIsolationMode(String),

    /// Invalid value
    #[error("invalid poller configuration: {0}")]
    Invalid(String),
}

/// Poller options, immutable once the poller is built
///
/// # Example
///
/// ```
/// use activity_poller::{IsolationMode, PollerConfig};
/// use std::time::Duration;
///
/// let config = PollerConfig::new()
///     .with_poll_retry_delay(Duration::from_secs(1))
///     .with_isolation_mode(IsolationMode::IsolatedProcess);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Delay after a failed poll before polling again (zero retries immediately)
    #[serde(with = "duration_millis", default)]
    pub poll_retry_delay: Duration,

    /// Execution strategy for fetched tasks
    #[serde(default)]
    pub isolation_mode: IsolationMode,

    /// Maximum simultaneous executions (in-process mode)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_retry_delay: Duration::ZERO,
            isolation_mode: IsolationMode::InProcess,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl PollerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `ACTIVITY_POLL_RETRY_MS`: retry delay after a failed poll (default 0)
    /// - `ACTIVITY_ISOLATION_MODE`: `in_process` or `isolated_process` (default `in_process`)
    /// - `ACTIVITY_CONCURRENCY`: max simultaneous executions (default 20)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("ACTIVITY_POLL_RETRY_MS") {
            let millis = value.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("ACTIVITY_POLL_RETRY_MS is not a number: {value}"))
            })?;
            config.poll_retry_delay = Duration::from_millis(millis);
        }

        if let Ok(value) = std::env::var("ACTIVITY_ISOLATION_MODE") {
            config.isolation_mode = value.parse()?;
        }

        if let Ok(value) = std::env::var("ACTIVITY_CONCURRENCY") {
            let concurrency = value.parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!("ACTIVITY_CONCURRENCY is not a number: {value}"))
            })?;
            config.concurrency = concurrency;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the delay applied after a failed poll
    pub fn with_poll_retry_delay(mut self, delay: Duration) -> Self {
        self.poll_retry_delay = delay;
        self
    }

    /// Set the isolation mode
    pub fn with_isolation_mode(mut self, mode: IsolationMode) -> Self {
        self.isolation_mode = mode;
        self
    }

    /// Set maximum concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
