//! Agent configuration file parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Startup configuration for both data-plane agents.
///
/// Option names match the keys of the TOML file one-to-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// CIDR from which VIPs are drawn, e.g. `127.128.0.0/9`.
    #[serde(default)]
    pub vip_cidr: String,
    /// DNS suffix that triggers local VIP hashing, e.g. `apps.internal.`.
    #[serde(default)]
    pub internal_apps_suffix: String,

    #[serde(default)]
    pub sd_base_url: String,
    pub sd_ca_file: Option<PathBuf>,
    pub sd_client_cert_file: Option<PathBuf>,
    pub sd_client_key_file: Option<PathBuf>,

    /// gRPC target of the control plane. Empty disables it.
    #[serde(default)]
    pub cp_address: String,
    pub cp_ca_file: Option<PathBuf>,
    pub cp_client_cert_file: Option<PathBuf>,
    pub cp_client_key_file: Option<PathBuf>,
    /// Deadline applied to every control-plane RPC.
    #[serde(default = "default_cp_timeout_ms")]
    pub cp_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub planners: Vec<PlannerConfig>,
    /// Initial value of the iptables logging flag.
    #[serde(default)]
    pub iptables_logging: bool,

    /// UDP endpoint for the metrics sink. Metrics are discarded when unset.
    pub metrics_address: Option<String>,
    #[serde(default)]
    pub metrics_prefix: String,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_debug_server_address")]
    pub debug_server_address: String,
    #[serde(default = "default_dns_adapter_address")]
    pub dns_adapter_address: String,
}

fn default_cp_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_debug_server_address() -> String {
    "127.0.0.1:22222".to_string()
}

fn default_dns_adapter_address() -> String {
    "127.0.0.1:8053".to_string()
}

/// Log verbosity accepted by the `log_level` option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
    Fatal,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    ///
    /// `tracing` has no fatal level, so `Fatal` maps to `error`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// Where a planner's rules live in the packet filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain name prefix; the enforcer appends a generation stamp.
    pub chain: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_parent_chain")]
    pub parent_chain: String,
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_parent_chain() -> String {
    "FORWARD".to_string()
}

/// One entry of the `planners` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannerConfig {
    /// A fixed rule list.
    Static {
        #[serde(flatten)]
        chain: ChainConfig,
        #[serde(default)]
        rules: Vec<Vec<String>>,
    },
    /// Default policy for traffic between containers on this host.
    Local {
        #[serde(flatten)]
        chain: ChainConfig,
        local_subnet: String,
    },
    /// Default policy for traffic arriving over the overlay device.
    Remote {
        #[serde(flatten)]
        chain: ChainConfig,
        vni: u32,
    },
}

impl PlannerConfig {
    pub fn chain(&self) -> &ChainConfig {
        match self {
            PlannerConfig::Static { chain, .. }
            | PlannerConfig::Local { chain, .. }
            | PlannerConfig::Remote { chain, .. } => chain,
        }
    }
}

impl OverlayConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate TOML content.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: OverlayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks shared by both agents.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if !self.vip_cidr.is_empty() {
            self.vip_cidr()?;
        }
        for planner in &self.planners {
            let name = &planner.chain().chain;
            if name.is_empty() || !name.is_ascii() {
                return Err(ConfigError::InvalidChain(name.clone()));
            }
        }
        Ok(())
    }

    /// Additional checks for the DNS adapter, which needs the VIP range
    /// and the service-discovery client material.
    pub fn validate_dns_adapter(&self) -> ConfigResult<()> {
        if self.vip_cidr.is_empty() {
            return Err(ConfigError::Missing("vip_cidr"));
        }
        if self.internal_apps_suffix.is_empty() {
            return Err(ConfigError::Missing("internal_apps_suffix"));
        }
        if self.sd_base_url.is_empty() {
            return Err(ConfigError::Missing("sd_base_url"));
        }
        if self.sd_ca_file.is_none() {
            return Err(ConfigError::Missing("sd_ca_file"));
        }
        if self.sd_client_cert_file.is_none() {
            return Err(ConfigError::Missing("sd_client_cert_file"));
        }
        if self.sd_client_key_file.is_none() {
            return Err(ConfigError::Missing("sd_client_key_file"));
        }
        if self.control_plane_enabled() {
            if self.cp_ca_file.is_none() {
                return Err(ConfigError::Missing("cp_ca_file"));
            }
            if self.cp_client_cert_file.is_none() {
                return Err(ConfigError::Missing("cp_client_cert_file"));
            }
            if self.cp_client_key_file.is_none() {
                return Err(ConfigError::Missing("cp_client_key_file"));
            }
        }
        Ok(())
    }

    /// The VIP range with host bits masked off.
    pub fn vip_cidr(&self) -> ConfigResult<Ipv4Net> {
        let net: Ipv4Net = self.vip_cidr.parse().map_err(|e: ipnet::AddrParseError| {
            ConfigError::InvalidCidr {
                value: self.vip_cidr.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(net.trunc())
    }

    pub fn control_plane_enabled(&self) -> bool {
        !self.cp_address.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cp_timeout(&self) -> Duration {
        Duration::from_millis(self.cp_timeout_ms)
    }
}
