//! Metric emission.
//!
//! The processor reports through a [`MetricsSink`]; what happens to the
//! samples (a StatsD bridge, an exporter) is up to the embedding process.
//! [`TracingMetrics`] logs them as structured `tracing` events under the
//! `weft::metrics` target.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Receiver for processor metrics.
pub trait MetricsSink: Send + Sync {
    /// Record a duration sample.
    fn timing(&self, name: &str, value: Duration, tags: &[(&str, &str)]);

    /// Set a gauge to an absolute value.
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);

    /// Increment a counter.
    fn incr(&self, name: &str, by: u64, tags: &[(&str, &str)]);
}

/// Emits every sample as a debug-level tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn timing(&self, name: &str, value: Duration, tags: &[(&str, &str)]) {
        debug!(
            target: "weft::metrics",
            metric = name,
            kind = "timing",
            value_ms = value.as_secs_f64() * 1000.0,
            tags = ?tags
        );
    }

    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        debug!(target: "weft::metrics", metric = name, kind = "gauge", value, tags = ?tags);
    }

    fn incr(&self, name: &str, by: u64, tags: &[(&str, &str)]) {
        debug!(target: "weft::metrics", metric = name, kind = "counter", value = by, tags = ?tags);
    }
}

/// Keeps samples in memory so callers can assert on them.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    timings: Mutex<Vec<(String, Duration)>>,
    gauges: Mutex<HashMap<String, f64>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All timing samples recorded under `name`, oldest first.
    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.timings
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, d)| *d)
            .collect()
    }

    /// Latest value of a gauge.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    /// Current counter total (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn timing(&self, name: &str, value: Duration, _tags: &[(&str, &str)]) {
        self.timings.lock().push((name.to_string(), value));
    }

    fn gauge(&self, name: &str, value: f64, _tags: &[(&str, &str)]) {
        self.gauges.lock().insert(name.to_string(), value);
    }

    fn incr(&self, name: &str, by: u64, _tags: &[(&str, &str)]) {
        *self.counters.lock().entry(name.to_string()).or_default() += by;
    }
}
