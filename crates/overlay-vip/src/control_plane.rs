//! gRPC client for the control plane's VIP lookup.
//!
//! The target address is resolved once at construction; one lazily-connected
//! channel is opened per resolved endpoint and calls rotate across them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;
use tracing::{debug, info};

use crate::balancer::RoundRobin;
use crate::proto::vip_resolver_copilot_client::VipResolverCopilotClient;
use crate::proto::GetVipByNameRequest;
use crate::shutdown::Shutdown;
use crate::tls::TlsMaterial;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("no transport security set (use insecure explicitly)")]
    NoTransportSecurity,

    #[error("the client connection is closing")]
    ChannelClosing,

    #[error("invalid control plane address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("control plane address {0} resolved to no endpoints")]
    NoEndpoints(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Rpc(#[from] tonic::Status),

    #[error("lookup cancelled")]
    Cancelled,
}

impl ControlPlaneError {
    /// Whether the caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Rpc(status)
                if matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
        )
    }
}

/// How to reach the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// `host:port` of the gRPC service.
    pub address: String,
    pub tls: Option<TlsMaterial>,
    /// Plaintext channel. Only meant for tests.
    pub insecure: bool,
    /// Deadline applied to every call.
    pub timeout: Duration,
}

type Client = VipResolverCopilotClient<Channel>;

/// Looks up VIPs over gRPC, rotating calls across every address the
/// configured host resolved to.
pub struct ControlPlaneClient {
    clients: Mutex<Option<Arc<RoundRobin<Client>>>>,
    timeout: Duration,
    shutdown: Shutdown,
}

impl ControlPlaneClient {
    /// Resolve `config.address` and prepare one lazy channel per endpoint.
    ///
    /// No connection is made here. Fails with `NoTransportSecurity` when
    /// neither TLS material nor `insecure` is given.
    pub async fn connect(config: ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let tls = match (&config.tls, config.insecure) {
            (Some(tls), _) => Some(tls),
            (None, true) => None,
            (None, false) => return Err(ControlPlaneError::NoTransportSecurity),
        };

        let (host, _) = config
            .address
            .rsplit_once(':')
            .ok_or_else(|| ControlPlaneError::InvalidAddress {
                address: config.address.clone(),
                reason: "expected host:port".into(),
            })?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&config.address)
            .await
            .map_err(|e| ControlPlaneError::InvalidAddress {
                address: config.address.clone(),
                reason: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ControlPlaneError::NoEndpoints(config.address));
        }

        let mut clients = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let scheme = if tls.is_some() { "https" } else { "http" };
            let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))?;
            if let Some(tls) = tls {
                endpoint = endpoint.tls_config(
                    ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(&tls.ca_pem))
                        .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem))
                        .domain_name(host.clone()),
                )?;
            }
            clients.push(VipResolverCopilotClient::new(endpoint.connect_lazy()));
        }

        let clients = RoundRobin::new(clients);
        info!(
            address = %config.address,
            endpoints = clients.len(),
            secure = tls.is_some(),
            "control plane client ready"
        );

        Ok(Self {
            clients: Mutex::new(Some(Arc::new(clients))),
            timeout: config.timeout,
            shutdown: Shutdown::default(),
        })
    }

    /// Fail pending and future calls with `Cancelled` once `shutdown` is `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Shutdown::new(shutdown);
        self
    }

    /// Ask the control plane for the VIP of `fqdn`. The `ip` field of the
    /// response is returned as sent; RPC errors are returned unchanged.
    pub async fn ip(&self, fqdn: &str) -> Result<String, ControlPlaneError> {
        let clients = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ControlPlaneError::ChannelClosing)?;
        let mut client = clients.next().cloned().ok_or(ControlPlaneError::ChannelClosing)?;

        if self.shutdown.is_triggered() {
            return Err(ControlPlaneError::Cancelled);
        }

        let request = GetVipByNameRequest {
            fqdn: fqdn.to_string(),
        };
        let call = tokio::time::timeout(self.timeout, client.get_vip_by_name(request));
        let response = tokio::select! {
            _ = self.shutdown.triggered() => return Err(ControlPlaneError::Cancelled),
            result = call => result
                .map_err(|_| tonic::Status::deadline_exceeded("control plane call timed out"))??,
        };

        let ip = response.into_inner().ip;
        debug!(%fqdn, %ip, "control plane resolved vip");
        Ok(ip)
    }

    /// Release the channels. A second call fails with `ChannelClosing`.
    pub fn close(&self) -> Result<(), ControlPlaneError> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|_| ())
            .ok_or(ControlPlaneError::ChannelClosing)
    }
}
