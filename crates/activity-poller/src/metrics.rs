//! Poller metrics
//!
//! Every emission is tagged with `namespace` and `task_queue`. Sinks are
//! pluggable: [`LogMetrics`] writes through `tracing`, [`OtelMetrics`]
//! records on an OpenTelemetry meter.

use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::task::QueueId;

/// Metric names
pub mod keys {
    /// Milliseconds between the end of one poll and the start of the next
    pub const TIME_SINCE_LAST_POLL: &str = "activity_poller.time_since_last_poll";

    /// Completed polls, tagged with `received_task`
    pub const POLL_COMPLETED: &str = "activity_poller.poll_completed";
}

/// Tag set attached to a metric emission
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricTags(Vec<(&'static str, String)>);

impl MetricTags {
    /// Tags identifying a queue
    pub fn for_queue(queue: &QueueId) -> Self {
        Self(vec![
            ("namespace", queue.namespace.clone()),
            ("task_queue", queue.task_queue.clone()),
        ])
    }

    /// Add a tag
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.push((key, value.into()));
        self
    }

    /// Look up a tag value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over tags
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    fn to_attributes(&self) -> Vec<KeyValue> {
        self.0
            .iter()
            .map(|(k, v)| KeyValue::new(*k, v.clone()))
            .collect()
    }
}

/// Destination for poller metrics
pub trait MetricsSink: Send + Sync {
    /// Record a duration sample
    fn timing(&self, key: &'static str, value: Duration, tags: &MetricTags);

    /// Increment a counter by one
    fn increment(&self, key: &'static str, tags: &MetricTags);
}

/// Writes metrics as debug-level tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn timing(&self, key: &'static str, value: Duration, tags: &MetricTags) {
        debug!(metric = key, value_ms = value.as_millis() as u64, tags = ?tags, "timing");
    }

    fn increment(&self, key: &'static str, tags: &MetricTags) {
        debug!(metric = key, tags = ?tags, "increment");
    }
}

/// Records metrics on an OpenTelemetry meter
///
/// Instruments are created on first use and cached per metric name.
pub struct OtelMetrics {
    meter: Meter,
    counters: DashMap<&'static str, Counter<u64>>,
    histograms: DashMap<&'static str, Histogram<f64>>,
}

impl OtelMetrics {
    /// Use the given meter
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Use the globally registered meter provider
    pub fn global() -> Self {
        Self::new(opentelemetry::global::meter("activity_poller"))
    }

    /// Number of instruments created so far
    pub fn instrument_count(&self) -> usize {
        self.counters.len() + self.histograms.len()
    }
}

impl MetricsSink for OtelMetrics {
    fn timing(&self, key: &'static str, value: Duration, tags: &MetricTags) {
        let histogram = self
            .histograms
            .entry(key)
            .or_insert_with(|| self.meter.f64_histogram(key).with_unit("ms").build())
            .clone();
        histogram.record(value.as_secs_f64() * 1000.0, &tags.to_attributes());
    }

    fn increment(&self, key: &'static str, tags: &MetricTags) {
        let counter = self
            .counters
            .entry(key)
            .or_insert_with(|| self.meter.u64_counter(key).build())
            .clone();
        counter.add(1, &tags.to_attributes());
    }
}

impl std::fmt::Debug for OtelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelMetrics")
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}
