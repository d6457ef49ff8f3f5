//! overlay-vip: hostname to overlay address resolution.
//!
//! # Architecture
//!
//! ```text
//! Resolver
//!   ├── *.<internal suffix>  → VipProvider (sha256 into the VIP range)
//!   ├── control plane set    → ControlPlaneClient (gRPC, round-robin)
//!   └── otherwise            → ServiceDiscoveryClient (HTTPS + mTLS, retry, shuffle)
//! ```

pub mod balancer;
pub mod control_plane;
pub mod resolver;
pub mod service_discovery;
mod shutdown;
pub mod tls;
pub mod vip;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("api");
}

pub use control_plane::{ControlPlaneClient, ControlPlaneConfig, ControlPlaneError};
pub use resolver::{Answer, BackendLookup, ResolveError, Resolver, Route, VipLookup};
pub use service_discovery::{HttpResponse, HttpTransport, MtlsTransport, SdError, ServiceDiscoveryClient};
pub use tls::{TlsError, TlsMaterial};
pub use vip::VipProvider;
