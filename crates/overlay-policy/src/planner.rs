//! Rule planners.
//!
//! A planner returns the complete desired contents of one chain each time
//! it is asked. The poll cycle calls planners one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use overlay_core::PlannerConfig;

use crate::error::PlannerError;
use crate::rules::{self, Chain, Rule, RuleSet};

#[async_trait]
pub trait Planner: Send + Sync {
    async fn get_rules_and_chain(&self) -> Result<RuleSet, PlannerError>;
}

/// Shared iptables logging flag.
///
/// Flipped by the debug endpoint and read by planners on every cycle.
#[derive(Debug, Clone, Default)]
pub struct LoggingState(Arc<AtomicBool>);

impl LoggingState {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Always returns the same rules.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    rule_set: RuleSet,
}

impl StaticPlanner {
    pub fn new(chain: Chain, rules: Vec<Rule>) -> Self {
        Self {
            rule_set: RuleSet::new(chain, rules),
        }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn get_rules_and_chain(&self) -> Result<RuleSet, PlannerError> {
        Ok(self.rule_set.clone())
    }
}

/// Traffic between containers on this host: allow replies, deny the rest.
#[derive(Debug, Clone)]
pub struct LocalPlanner {
    chain: Chain,
    local_subnet: String,
    logging: LoggingState,
}

impl LocalPlanner {
    pub fn new(chain: Chain, local_subnet: impl Into<String>, logging: LoggingState) -> Self {
        Self {
            chain,
            local_subnet: local_subnet.into(),
            logging,
        }
    }
}

#[async_trait]
impl Planner for LocalPlanner {
    async fn get_rules_and_chain(&self) -> Result<RuleSet, PlannerError> {
        let mut planned = vec![rules::accept_existing_local()];
        if self.logging.is_enabled() {
            planned.push(rules::log_local_reject(&self.local_subnet));
        }
        planned.push(rules::default_deny_local(&self.local_subnet));
        Ok(RuleSet::new(self.chain.clone(), planned))
    }
}

/// Traffic arriving over the overlay device: allow replies, deny the rest.
#[derive(Debug, Clone)]
pub struct RemotePlanner {
    chain: Chain,
    vni: u32,
    logging: LoggingState,
}

impl RemotePlanner {
    pub fn new(chain: Chain, vni: u32, logging: LoggingState) -> Self {
        Self { chain, vni, logging }
    }
}

#[async_trait]
impl Planner for RemotePlanner {
    async fn get_rules_and_chain(&self) -> Result<RuleSet, PlannerError> {
        let mut planned = vec![rules::accept_existing_remote(self.vni)];
        if self.logging.is_enabled() {
            planned.push(rules::log_remote_reject(self.vni));
        }
        planned.push(rules::default_deny_remote(self.vni));
        Ok(RuleSet::new(self.chain.clone(), planned))
    }
}

/// Build the planners listed in the configuration, in order.
pub fn from_config(configs: &[PlannerConfig], logging: &LoggingState) -> Vec<Box<dyn Planner>> {
    configs
        .iter()
        .map(|config| -> Box<dyn Planner> {
            let chain = Chain::from(config.chain());
            match config {
                PlannerConfig::Static { rules, .. } => Box::new(StaticPlanner::new(
                    chain,
                    rules.iter().cloned().map(Rule::from).collect(),
                )),
                PlannerConfig::Local { local_subnet, .. } => {
                    Box::new(LocalPlanner::new(chain, local_subnet.clone(), logging.clone()))
                }
                PlannerConfig::Remote { vni, .. } => {
                    Box::new(RemotePlanner::new(chain, *vni, logging.clone()))
                }
            }
        })
        .collect()
}
