//! Metrics emission seam.
//!
//! The framework owns a single sink and passes it to components
//! explicitly; when nothing is wired, emission is a no-op. The registry
//! emits `discovery.registrations` (counter, `status` tag) and
//! `discovery.registration.duration_ms` (histogram).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Destination for framework metrics.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn incr_counter(&self, name: &str, tags: &[(&str, &str)]);

    /// Record one duration observation into a histogram.
    fn record_duration(&self, name: &str, value: Duration, tags: &[(&str, &str)]);
}

/// Sink that drops everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _tags: &[(&str, &str)]) {}
    fn record_duration(&self, _name: &str, _value: Duration, _tags: &[(&str, &str)]) {}
}

/// Shared no-op sink instance.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// In-memory sink for asserting emissions in tests and development.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    durations: Mutex<HashMap<String, Vec<Duration>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter under its fully-tagged name.
    pub fn counter(&self, name_with_tags: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name_with_tags)
            .copied()
            .unwrap_or(0)
    }

    /// Observations recorded under a fully-tagged histogram name.
    pub fn durations(&self, name_with_tags: &str) -> Vec<Duration> {
        self.durations
            .lock()
            .unwrap()
            .get(name_with_tags)
            .cloned()
            .unwrap_or_default()
    }

    fn keyed(name: &str, tags: &[(&str, &str)]) -> String {
        if tags.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}{{{}}}", name, rendered.join(","))
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr_counter(&self, name: &str, tags: &[(&str, &str)]) {
        let key = Self::keyed(name, tags);
        *self.counters.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    fn record_duration(&self, name: &str, value: Duration, tags: &[(&str, &str)]) {
        let key = Self::keyed(name, tags);
        self.durations
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(value);
    }
}
