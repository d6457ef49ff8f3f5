//! overlayd: per-host overlay data-plane daemon.
//!
//! # Usage
//!
//! ```text
//! overlayd policy-agent --config /etc/overlay/agent.toml
//! overlayd dns-adapter  --config /etc/overlay/dns-adapter.toml
//! ```

mod dns_adapter;
mod policy_agent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use overlay_core::OverlayConfig;
use overlay_metrics::{DiscardSink, MetricsSink, UdpSink};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "overlayd", about = "Overlay host daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge the host packet filter onto the configured planners.
    PolicyAgent {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Answer overlay name lookups for the local DNS server.
    DnsAdapter {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (Command::PolicyAgent { config } | Command::DnsAdapter { config }) = &cli.command;
    let config = OverlayConfig::from_file(config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .init();

    // tonic and the service-discovery transport share one process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Command::PolicyAgent { .. } => policy_agent::run(config).await,
        Command::DnsAdapter { .. } => dns_adapter::run(config).await,
    }
}

/// Flip `shutdown` on Ctrl-C.
async fn forward_ctrl_c(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "installing ctrl-c handler");
        // Keep the sender alive so receivers do not read a closed channel as shutdown.
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

/// The configured metrics sink and, for UDP, its running emitter task.
async fn metrics_sink(
    config: &OverlayConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<dyn MetricsSink>, Option<JoinHandle<()>>)> {
    let Some(address) = &config.metrics_address else {
        info!("no metrics address configured, metrics are discarded");
        return Ok((Arc::new(DiscardSink), None));
    };

    let (sink, emitter) =
        UdpSink::connect(address, &config.metrics_prefix, METRICS_FLUSH_INTERVAL).await?;
    let handle = tokio::spawn(emitter.run(shutdown));
    Ok((Arc::new(sink), Some(handle)))
}
