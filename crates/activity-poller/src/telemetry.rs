// Logging setup for worker processes
//
// Installs a tracing-subscriber registry with a console layer filtered by
// RUST_LOG / LOG_LEVEL. Metrics go through the MetricsSink passed to the
// poller, not through this module.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_FILTER: &str = "activity_poller=info";

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "debug", "activity_poller=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "activity-worker".to_string(),
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "activity-worker")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "activity-worker".to_string()),
            enable_console: true,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }

    /// Filter built from `log_filter`, falling back to the default on parse errors
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed (for example by a
/// test harness); the existing one is left in place.
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(config.env_filter()),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, "Telemetry initialized");
    }
    installed
}
