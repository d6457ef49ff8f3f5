//! overlay-api: operator HTTP surfaces for the overlay agents.
//!
//! | Method | Path | Router | Description |
//! |---|---|---|---|
//! | GET | `/iptables-logging` | [`logging_router`] | Current logging flag |
//! | PUT | `/iptables-logging` | [`logging_router`] | Set the logging flag |
//! | GET | `/?name=<fqdn>&type=<n>` | [`dns_router`] | Resolve a name, DNS-over-JSON |
//! | GET | `/health` | [`dns_router`] | Liveness |

pub mod dns;
pub mod logging;

pub use dns::{DnsState, dns_router};
pub use logging::logging_router;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Serve `router` on `address` until `shutdown` flips to `true`.
pub async fn serve(
    address: &str,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    let local: SocketAddr = listener.local_addr()?;
    info!(address = %local, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
