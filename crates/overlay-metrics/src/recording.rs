//! In-memory sink that remembers every reported metric.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::MetricsSink;

/// A single reported metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedMetric {
    Duration { name: String, value: Duration },
    Counter { name: String },
}

/// Sink that keeps all metrics in memory, in report order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    metrics: Mutex<Vec<RecordedMetric>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedMetric>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything reported so far.
    pub fn metrics(&self) -> Vec<RecordedMetric> {
        self.lock().clone()
    }

    /// All durations reported under `name`.
    pub fn durations(&self, name: &str) -> Vec<Duration> {
        self.lock()
            .iter()
            .filter_map(|m| match m {
                RecordedMetric::Duration { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// How many times the counter `name` was incremented.
    pub fn counter(&self, name: &str) -> usize {
        self.lock()
            .iter()
            .filter(|m| matches!(m, RecordedMetric::Counter { name: n } if n == name))
            .count()
    }
}

impl MetricsSink for RecordingSink {
    fn send_duration(&self, name: &str, duration: Duration) {
        self.lock()
            .push(RecordedMetric::Duration {
                name: name.to_string(),
                value: duration,
            });
    }

    fn increment_counter(&self, name: &str) {
        self.lock()
            .push(RecordedMetric::Counter {
                name: name.to_string(),
            });
    }
}
