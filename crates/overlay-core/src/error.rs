//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the startup configuration.
///
/// Every variant is fatal: the daemon refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid vip_cidr {value:?}: {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("poll_interval_ms must be greater than zero")]
    ZeroPollInterval,

    #[error("invalid chain name {0:?}: must be non-empty ASCII")]
    InvalidChain(String),
}
