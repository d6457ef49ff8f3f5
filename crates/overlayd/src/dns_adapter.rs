//! DNS adapter mode.
//!
//! Resolves overlay names for the local DNS server: internal names get a
//! hashed VIP, the rest go to the control plane when one is configured and
//! to service discovery otherwise.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use overlay_api::DnsState;
use overlay_core::OverlayConfig;
use overlay_vip::{
    ControlPlaneClient, ControlPlaneConfig, Resolver, ServiceDiscoveryClient, TlsMaterial,
    VipProvider,
};
use tokio::sync::watch;
use tracing::{info, warn};

fn required<'a>(path: &'a Option<std::path::PathBuf>, key: &str) -> anyhow::Result<&'a Path> {
    path.as_deref()
        .with_context(|| format!("missing required configuration key {key}"))
}

pub async fn run(config: OverlayConfig) -> anyhow::Result<()> {
    config.validate_dns_adapter()?;
    info!("dns adapter starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (metrics, emitter_handle) = crate::metrics_sink(&config, shutdown_rx.clone()).await?;

    let sd_tls = TlsMaterial::load(
        required(&config.sd_ca_file, "sd_ca_file")?,
        required(&config.sd_client_cert_file, "sd_client_cert_file")?,
        required(&config.sd_client_key_file, "sd_client_key_file")?,
    )
    .context("loading service discovery client material")?;
    let service_discovery = ServiceDiscoveryClient::new(&config.sd_base_url, &sd_tls)?
        .with_shutdown(shutdown_rx.clone());

    let vips = VipProvider::new(config.vip_cidr()?);
    info!(cidr = %vips.cidr(), suffix = %config.internal_apps_suffix, "vip range");
    let mut resolver = Resolver::new(
        vips,
        &config.internal_apps_suffix,
        Arc::new(service_discovery),
    );

    let control_plane = if config.control_plane_enabled() {
        let tls = TlsMaterial::load(
            required(&config.cp_ca_file, "cp_ca_file")?,
            required(&config.cp_client_cert_file, "cp_client_cert_file")?,
            required(&config.cp_client_key_file, "cp_client_key_file")?,
        )
        .context("loading control plane client material")?;
        let client = ControlPlaneClient::connect(ControlPlaneConfig {
            address: config.cp_address.clone(),
            tls: Some(tls),
            insecure: false,
            timeout: config.cp_timeout(),
        })
        .await
        .with_context(|| format!("connecting to control plane at {}", config.cp_address))?
        .with_shutdown(shutdown_rx.clone());

        let client = Arc::new(client);
        resolver = resolver.with_control_plane(client.clone());
        info!(address = %config.cp_address, "control plane configured");
        Some(client)
    } else {
        None
    };

    let signal_handle = tokio::spawn(crate::forward_ctrl_c(shutdown_tx));
    let state = DnsState {
        resolver: Arc::new(resolver),
        metrics,
    };
    let served = overlay_api::serve(
        &config.dns_adapter_address,
        overlay_api::dns_router(state),
        shutdown_rx,
    )
    .await;
    signal_handle.abort();

    if let Some(client) = control_plane
        && let Err(e) = client.close()
    {
        warn!(error = %e, "closing control plane channel");
    }
    if let Some(handle) = emitter_handle {
        let _ = handle.await;
    }
    served?;

    info!("dns adapter stopped");
    Ok(())
}
