//! Interval driver for the poll cycle.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::converger::SinglePollCycle;

/// Runs a [`SinglePollCycle`] on a fixed interval until shutdown.
///
/// The first cycle runs immediately. A failed cycle is logged and the next
/// tick tries again.
pub struct Poller {
    cycle: SinglePollCycle,
    interval: Duration,
}

impl Poller {
    /// `interval` is clamped to at least one millisecond.
    pub fn new(cycle: SinglePollCycle, interval: Duration) -> Self {
        Self {
            cycle,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run a cycle on every tick until `shutdown` flips to `true` or its
    /// sender is dropped. Cycle errors are logged and the loop continues.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SinglePollCycle {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "policy poller started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("policy poller shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        info!("policy poller shutting down");
                        break;
                    }
                    if let Err(e) = self.cycle.do_cycle().await {
                        error!(error = %e, "poll cycle failed");
                    }
                }
            }
        }
        self.cycle
    }
}
