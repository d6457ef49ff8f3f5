//! Policy agent mode.
//!
//! 1. Builds the planners from configuration around one shared logging flag
//! 2. Runs the poll loop against the real `iptables` binaries
//! 3. Serves `/iptables-logging` on the debug address
//! 4. On Ctrl-C, stops the loop, the server and the metrics emitter

use std::sync::Arc;

use overlay_core::OverlayConfig;
use overlay_policy::{ChainEnforcer, IptablesCommand, LoggingState, Poller, SinglePollCycle, planner};
use tokio::sync::watch;
use tracing::info;

pub async fn run(config: OverlayConfig) -> anyhow::Result<()> {
    info!(planners = config.planners.len(), "policy agent starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (metrics, emitter_handle) = crate::metrics_sink(&config, shutdown_rx.clone()).await?;

    let logging = LoggingState::new(config.iptables_logging);
    let planners = planner::from_config(&config.planners, &logging);
    let enforcer = ChainEnforcer::new(IptablesCommand::new());
    let cycle = SinglePollCycle::new(planners, Arc::new(enforcer), metrics);

    let poller = Poller::new(cycle, config.poll_interval());
    let poller_handle = tokio::spawn(poller.run(shutdown_rx.clone()));
    let signal_handle = tokio::spawn(crate::forward_ctrl_c(shutdown_tx));

    info!(address = %config.debug_server_address, "debug server starting");
    let served = overlay_api::serve(
        &config.debug_server_address,
        overlay_api::logging_router(logging),
        shutdown_rx,
    )
    .await;
    // Dropping the sender stops the background tasks when serving failed early.
    signal_handle.abort();

    let _ = poller_handle.await;
    if let Some(handle) = emitter_handle {
        let _ = handle.await;
    }
    served?;

    info!("policy agent stopped");
    Ok(())
}
