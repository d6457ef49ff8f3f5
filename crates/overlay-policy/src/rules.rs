//! Rule, chain and rule-set model plus the rule constructors used by the
//! bundled planners.

use std::fmt;

use overlay_core::ChainConfig;

/// Interface containers on this host are bridged to.
pub const LOCAL_BRIDGE: &str = "cni-flannel0";

/// A single packet-filter rule as an ordered list of tokens.
///
/// The tokens are everything after `-A <chain>`; equality is token-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Rule(Vec<String>);

impl Rule {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for Rule {
    fn from(tokens: Vec<String>) -> Self {
        Self(tokens)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Where a rule set lives: a chain prefix inside a table, jumped to from a
/// parent chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chain {
    pub table: String,
    pub parent_chain: String,
    pub prefix: String,
}

impl Chain {
    pub fn new(
        table: impl Into<String>,
        parent_chain: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            parent_chain: parent_chain.into(),
            prefix: prefix.into(),
        }
    }
}

impl From<&ChainConfig> for Chain {
    fn from(config: &ChainConfig) -> Self {
        Self::new(&config.table, &config.parent_chain, &config.chain)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.table, self.parent_chain, self.prefix)
    }
}

/// The full desired contents of one chain.
///
/// Two rule sets are equal when the chains match and the rules are equal
/// element-wise in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub chain: Chain,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(chain: Chain, rules: Vec<Rule>) -> Self {
        Self { chain, rules }
    }

    /// A rule set with no rules for `chain`.
    pub fn empty(chain: Chain) -> Self {
        Self::new(chain, Vec::new())
    }
}

/// Rate-limited `LOG` rule matching `guard`.
pub fn log_rule(guard: &[String], name: &str) -> Rule {
    let mut tokens = guard.to_vec();
    tokens.extend(
        ["-m", "limit", "--limit", "2/min", "--jump", "LOG", "--log-prefix", name]
            .map(String::from),
    );
    Rule(tokens)
}

pub fn accept_existing_local() -> Rule {
    Rule::new([
        "-i",
        LOCAL_BRIDGE,
        "-m",
        "state",
        "--state",
        "ESTABLISHED,RELATED",
        "--jump",
        "ACCEPT",
    ])
}

fn local_guard(local_subnet: &str) -> Vec<String> {
    ["-i", LOCAL_BRIDGE, "--source", local_subnet, "-d", local_subnet]
        .map(String::from)
        .to_vec()
}

pub fn default_deny_local(local_subnet: &str) -> Rule {
    let mut tokens = local_guard(local_subnet);
    tokens.extend(["--jump", "REJECT"].map(String::from));
    Rule(tokens)
}

pub fn log_local_reject(local_subnet: &str) -> Rule {
    log_rule(&local_guard(local_subnet), "REJECT_LOCAL:")
}

/// The overlay device for `vni`.
pub fn overlay_device(vni: u32) -> String {
    format!("flannel.{vni}")
}

pub fn accept_existing_remote(vni: u32) -> Rule {
    Rule::new([
        "-i".to_string(),
        overlay_device(vni),
        "-m".into(),
        "state".into(),
        "--state".into(),
        "ESTABLISHED,RELATED".into(),
        "--jump".into(),
        "ACCEPT".into(),
    ])
}

pub fn default_deny_remote(vni: u32) -> Rule {
    Rule::new(["-i".to_string(), overlay_device(vni), "--jump".into(), "REJECT".into()])
}

pub fn log_remote_reject(vni: u32) -> Rule {
    log_rule(&["-i".to_string(), overlay_device(vni)], "REJECT_REMOTE:")
}
