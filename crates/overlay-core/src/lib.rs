//! overlay-core: configuration shared by the overlay data-plane agents.
//!
//! Both agents (the policy poller and the DNS adapter) are configured
//! from a single TOML file loaded once at startup. Everything in here is
//! immutable after [`OverlayConfig::from_file`] returns.

pub mod config;
pub mod error;

pub use config::{ChainConfig, LogLevel, OverlayConfig, PlannerConfig};
pub use error::{ConfigError, ConfigResult};
