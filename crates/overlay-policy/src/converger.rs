//! The diff-driven poll cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use overlay_metrics::MetricsSink;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::enforcer::Enforcer;
use crate::error::CycleError;
use crate::planner::Planner;
use crate::rules::{Chain, RuleSet};

pub const METRIC_ENFORCE_TIME: &str = "iptablesEnforceTime";
pub const METRIC_POLL_TIME: &str = "totalPollTime";

/// Runs every planner once, enforcing only chains whose desired rules
/// changed since they were last applied.
///
/// The last-applied cache starts empty, so the first cycle enforces every
/// chain, including chains whose desired rule set is empty, regardless of
/// what the kernel already holds.
pub struct SinglePollCycle {
    planners: Vec<Box<dyn Planner>>,
    enforcer: Arc<dyn Enforcer>,
    metrics: Arc<dyn MetricsSink>,
    last_applied: HashMap<Chain, RuleSet>,
}

impl SinglePollCycle {
    /// Builds a cycle that runs `planners` in order on every call to
    /// [`do_cycle`](Self::do_cycle). Nothing is enforced until then.
    pub fn new(
        planners: Vec<Box<dyn Planner>>,
        enforcer: Arc<dyn Enforcer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            planners,
            enforcer,
            metrics,
            last_applied: HashMap::new(),
        }
    }

    /// The rule set last enforced for `chain`, if any.
    pub fn last_applied(&self, chain: &Chain) -> Option<&RuleSet> {
        self.last_applied.get(chain)
    }

    /// Plans and enforces once.
    ///
    /// Stops at the first planner or enforcer error. Chains enforced before
    /// the error keep their new state, and the failing chain is retried on the
    /// next call. Durations are reported only when the whole cycle succeeds.
    pub async fn do_cycle(&mut self) -> Result<(), CycleError> {
        let cycle_start = Instant::now();
        let mut enforce_time = Duration::ZERO;

        for planner in &self.planners {
            let desired = planner
                .get_rules_and_chain()
                .await
                .map_err(CycleError::GetRules)?;

            let old_rules = self
                .last_applied
                .get(&desired.chain)
                .map_or(0, |applied| applied.rules.len());
            let unchanged = self
                .last_applied
                .get(&desired.chain)
                .is_some_and(|applied| *applied == desired);
            if unchanged {
                continue;
            }

            info!(
                chain = %desired.chain,
                old = old_rules,
                new = desired.rules.len(),
                "updating iptables rules"
            );
            for rule in &desired.rules {
                debug!(chain = %desired.chain, %rule, "desired rule");
            }

            let enforce_start = Instant::now();
            self.enforcer
                .enforce_rules_and_chain(&desired)
                .await
                .map_err(CycleError::Enforce)?;
            enforce_time += enforce_start.elapsed();

            self.last_applied.insert(desired.chain.clone(), desired);
        }

        self.metrics.send_duration(METRIC_ENFORCE_TIME, enforce_time);
        self.metrics
            .send_duration(METRIC_POLL_TIME, cycle_start.elapsed());
        Ok(())
    }
}
