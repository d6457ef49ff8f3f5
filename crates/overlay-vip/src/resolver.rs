//! Hostname resolution façade.
//!
//! Names under the internal-apps suffix get a locally hashed VIP. Anything
//! else goes to the control plane when one is configured, and to service
//! discovery otherwise. Nothing is cached here.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::control_plane::{ControlPlaneClient, ControlPlaneError};
use crate::service_discovery::{HttpTransport, SdError, ServiceDiscoveryClient};
use crate::vip::VipProvider;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("hostname is empty")]
    EmptyHostname,

    #[error("could not connect to service discovery controller: {0}")]
    ServiceDiscovery(#[source] SdError),

    #[error("could not connect to control plane: {0}")]
    ControlPlane(#[source] ControlPlaneError),
}

impl ResolveError {
    /// Whether the same lookup may succeed if retried shortly, such as when
    /// the control plane is unavailable or timed out.
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::ControlPlane(e) => e.is_transient(),
            ResolveError::EmptyHostname | ResolveError::ServiceDiscovery(_) => false,
        }
    }
}

/// Source of backend instance IPs.
#[async_trait]
pub trait BackendLookup: Send + Sync {
    async fn ips(&self, name: &str) -> Result<Vec<Ipv4Addr>, SdError>;
}

/// Source of a single VIP per FQDN.
#[async_trait]
pub trait VipLookup: Send + Sync {
    async fn ip(&self, fqdn: &str) -> Result<String, ControlPlaneError>;
}

#[async_trait]
impl<T: HttpTransport> BackendLookup for ServiceDiscoveryClient<T> {
    async fn ips(&self, name: &str) -> Result<Vec<Ipv4Addr>, SdError> {
        ServiceDiscoveryClient::ips(self, name).await
    }
}

#[async_trait]
impl VipLookup for ControlPlaneClient {
    async fn ip(&self, fqdn: &str) -> Result<String, ControlPlaneError> {
        ControlPlaneClient::ip(self, fqdn).await
    }
}

/// Which backend answers a given hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    LocalVip,
    ControlPlane,
    ServiceDiscovery,
}

/// Result of a lookup, tagged by the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Vip(Ipv4Addr),
    /// The control plane's answer, as sent.
    ControlPlane(String),
    Backends(Vec<Ipv4Addr>),
}

impl Answer {
    /// Addresses in answer order, as text.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            Answer::Vip(ip) => vec![ip.to_string()],
            Answer::ControlPlane(ip) => vec![ip.clone()],
            Answer::Backends(ips) => ips.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Routes each hostname to the local VIP hash, the control plane or
/// service discovery, and returns that backend's answer.
pub struct Resolver {
    vips: VipProvider,
    internal_suffix: String,
    control_plane: Option<Arc<dyn VipLookup>>,
    service_discovery: Arc<dyn BackendLookup>,
}

impl Resolver {
    /// A resolver that hashes names under `internal_suffix` into `vips` and
    /// sends everything else to `service_discovery`. The suffix is
    /// canonicalized, so `apps.internal` and `.apps.internal.` are the same.
    pub fn new(
        vips: VipProvider,
        internal_suffix: &str,
        service_discovery: Arc<dyn BackendLookup>,
    ) -> Self {
        let suffix = canonical(internal_suffix);
        Self {
            vips,
            internal_suffix: suffix.trim_start_matches('.').to_string(),
            control_plane: None,
            service_discovery,
        }
    }

    /// Send non-internal names to `control_plane` instead of service
    /// discovery.
    pub fn with_control_plane(mut self, control_plane: Arc<dyn VipLookup>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Classify an already-canonical hostname. The suffix only matches on
    /// a label boundary, so `app.myapps.internal.` is not under `apps.internal.`.
    pub fn route(&self, hostname: &str) -> Route {
        let internal = hostname.len() > self.internal_suffix.len()
            && hostname.ends_with(&self.internal_suffix)
            && hostname.as_bytes()[hostname.len() - self.internal_suffix.len() - 1] == b'.';

        if internal {
            Route::LocalVip
        } else if self.control_plane.is_some() {
            Route::ControlPlane
        } else {
            Route::ServiceDiscovery
        }
    }

    pub async fn resolve(&self, hostname: &str) -> Result<Answer, ResolveError> {
        let hostname = canonical(hostname);
        if hostname == "." {
            return Err(ResolveError::EmptyHostname);
        }

        let route = self.route(&hostname);
        debug!(%hostname, ?route, "resolving");

        match (route, &self.control_plane) {
            (Route::LocalVip, _) => Ok(Answer::Vip(self.vips.get(&hostname))),
            (Route::ControlPlane, Some(cp)) => cp
                .ip(&hostname)
                .await
                .map(Answer::ControlPlane)
                .map_err(ResolveError::ControlPlane),
            _ => self
                .service_discovery
                .ips(&hostname)
                .await
                .map(Answer::Backends)
                .map_err(ResolveError::ServiceDiscovery),
        }
    }
}

/// Lowercase, trimmed, and dot-terminated.
fn canonical(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}
