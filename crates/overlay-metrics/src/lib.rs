//! overlay-metrics: timing and counter reporting for the overlay agents.
//!
//! The agents only depend on the [`MetricsSink`] trait. Two sinks ship
//! with the crate:
//!
//! ```text
//! UdpSink (cheap handle, Clone)
//!   └── bounded queue ──► UdpEmitter::run()
//!                           ├── batches datagrams up to 512 bytes
//!                           └── flushes every interval / on shutdown
//!
//! RecordingSink
//!   └── keeps every metric in memory (tests, dry runs)
//! ```
//!
//! Sinks never surface failures to their callers: a full queue or a failed
//! send is logged at debug and the metric is dropped.

pub mod recording;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

pub use recording::{RecordedMetric, RecordingSink};
pub use udp::{MetricsError, UdpEmitter, UdpSink};

/// The two operations the agents report through.
pub trait MetricsSink: Send + Sync {
    /// Report a named duration.
    fn send_duration(&self, name: &str, duration: Duration);

    /// Increment a named counter by one.
    fn increment_counter(&self, name: &str);
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn send_duration(&self, name: &str, duration: Duration) {
        (**self).send_duration(name, duration)
    }

    fn increment_counter(&self, name: &str) {
        (**self).increment_counter(name)
    }
}

/// A sink that drops everything. Used when no metrics address is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl MetricsSink for DiscardSink {
    fn send_duration(&self, _name: &str, _duration: Duration) {}

    fn increment_counter(&self, _name: &str) {}
}
