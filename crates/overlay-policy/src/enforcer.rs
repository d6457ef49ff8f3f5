//! Chain enforcement.
//!
//! A rule set is never edited in place. Each enforce builds a fresh chain
//! named `<prefix><10-digit generation>`, fills it, links it at the top of
//! the parent chain and only then unlinks and removes older generations.
//! Traffic always sees either the old chain or the complete new one.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::EnforceError;
use crate::iptables::IpTables;
use crate::rules::{Chain, Rule, RuleSet};

#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Replace the contents of `rule_set.chain` with `rule_set.rules`.
    async fn enforce_rules_and_chain(&self, rule_set: &RuleSet) -> Result<(), EnforceError>;
}

/// Source of generation stamps.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Enforces rule sets through generation-stamped chains.
pub struct ChainEnforcer<I, C = SystemClock> {
    iptables: I,
    clock: C,
}

impl<I: IpTables> ChainEnforcer<I> {
    pub fn new(iptables: I) -> Self {
        Self::with_clock(iptables, SystemClock)
    }
}

impl<I: IpTables, C: Clock> ChainEnforcer<I, C> {
    pub fn with_clock(iptables: I, clock: C) -> Self {
        Self { iptables, clock }
    }

    pub fn iptables(&self) -> &I {
        &self.iptables
    }

    /// Generations of `chain` currently jumped to from its parent, oldest first.
    async fn linked_generations(&self, chain: &Chain) -> Result<BTreeMap<u64, String>, EnforceError> {
        let pattern = generation_pattern(&chain.prefix)?;
        let lines = self
            .iptables
            .list(&chain.table, &chain.parent_chain)
            .await
            .map_err(|source| EnforceError::List {
                chain: chain.parent_chain.clone(),
                source,
            })?;

        Ok(lines
            .iter()
            .filter_map(|line| pattern.captures(line))
            .filter_map(|caps| {
                let generation: u64 = caps.get(2)?.as_str().parse().ok()?;
                Some((generation, caps.get(1)?.as_str().to_string()))
            })
            .collect())
    }

    /// Best-effort removal of a chain that was never linked.
    async fn discard(&self, table: &str, name: &str) {
        if let Err(e) = self.iptables.clear_chain(table, name).await {
            warn!(%table, chain = %name, error = %e, "clearing abandoned chain");
        }
        if let Err(e) = self.iptables.delete_chain(table, name).await {
            warn!(%table, chain = %name, error = %e, "deleting abandoned chain");
        }
    }

    async fn remove_generation(&self, chain: &Chain, name: &str) -> Result<(), EnforceError> {
        self.iptables
            .delete(&chain.table, &chain.parent_chain, &jump_to(name))
            .await
            .map_err(EnforceError::Cleanup)?;
        self.iptables
            .clear_chain(&chain.table, name)
            .await
            .map_err(EnforceError::Cleanup)?;
        self.iptables
            .delete_chain(&chain.table, name)
            .await
            .map_err(EnforceError::Cleanup)
    }
}

#[async_trait]
impl<I: IpTables, C: Clock> Enforcer for ChainEnforcer<I, C> {
    async fn enforce_rules_and_chain(&self, rule_set: &RuleSet) -> Result<(), EnforceError> {
        let chain = &rule_set.chain;
        let existing = self.linked_generations(chain).await?;

        let now = self.clock.now();
        let generation = match existing.keys().next_back() {
            Some(&newest) if newest >= now => newest + 1,
            _ => now,
        };
        let name = format!("{}{generation:010}", chain.prefix);

        self.iptables
            .new_chain(&chain.table, &name)
            .await
            .map_err(EnforceError::CreateChain)?;

        if let Err(e) = self
            .iptables
            .bulk_append(&chain.table, &name, &rule_set.rules)
            .await
        {
            self.discard(&chain.table, &name).await;
            return Err(EnforceError::Append(e));
        }

        if let Err(e) = self
            .iptables
            .bulk_insert(&chain.table, &chain.parent_chain, 1, &[jump_to(&name)])
            .await
        {
            self.discard(&chain.table, &name).await;
            return Err(EnforceError::Insert(e));
        }

        for old in existing.values() {
            debug!(chain = %old, "removing old generation");
            self.remove_generation(chain, old).await?;
        }

        info!(
            table = %chain.table,
            parent = %chain.parent_chain,
            chain = %name,
            rules = rule_set.rules.len(),
            replaced = existing.len(),
            "enforced chain"
        );
        Ok(())
    }
}

fn jump_to(chain: &str) -> Rule {
    Rule::new(["-j", chain])
}

/// Matches `<prefix><10 digits>` as a whole chain name.
fn generation_pattern(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?:^|\s)({}([0-9]{{10}}))(?:\s|$)",
        regex::escape(prefix)
    ))
}
