//! Service-discovery client.
//!
//! Resolves an application name to the IPs of its running instances by
//! calling `GET {base}/v1/registration/{name}` over mutual TLS. Non-200
//! responses are retried with jittered backoff; transport failures are not.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustls::pki_types::ServerName;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tower::Service;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;
use crate::tls::{TlsError, TlsMaterial};

/// Total attempts per lookup, including the first.
pub const MAX_ATTEMPTS: u32 = 4;

/// Upper bound on a single attempt, connect through body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SdError {
    #[error("invalid service discovery url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("http client do: {0}")]
    Transport(#[source] BoxError),

    #[error("http client do: request timed out after {0:?}")]
    Timeout(Duration),

    #[error("received non-successful response from server: {0}")]
    Status(StatusCode),

    #[error("unmarshal json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("lookup cancelled")]
    Cancelled,
}

impl SdError {
    fn transport(e: impl Into<BoxError>) -> Self {
        SdError::Transport(e.into())
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Issues GET requests for the client. Implementations must be shareable
/// across concurrent lookups.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, uri: &Uri) -> Result<HttpResponse, SdError>;
}

/// TLS stream over TCP, as handed to the pooled client.
struct TlsConnection(TokioIo<TlsStream<TcpStream>>);

impl hyper::rt::Read for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for TlsConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Opens TCP connections and runs the client side of the TLS handshake,
/// giving up on the handshake after [`TLS_HANDSHAKE_TIMEOUT`].
#[derive(Clone)]
struct MtlsConnector {
    tls: TlsConnector,
}

impl Service<Uri> for MtlsConnector {
    type Response = TlsConnection;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TlsConnection, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or("missing host")?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let port = uri.port_u16().unwrap_or(443);

            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            let server_name = ServerName::try_from(host.clone())?;
            let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.connect(server_name, tcp))
                .await
                .map_err(|_| "tls handshake timeout")??;

            debug!(%host, port, "opened service discovery connection");
            Ok::<_, BoxError>(TlsConnection(TokioIo::new(stream)))
        })
    }
}

/// HTTPS/1.1 transport presenting a client certificate.
///
/// Connections are pooled per authority with no idle timeout and reused as
/// long as the server keeps them open.
pub struct MtlsTransport {
    client: Client<MtlsConnector, Empty<Bytes>>,
}

impl MtlsTransport {
    /// Transport authenticating with `tls` and trusting only its CA.
    pub fn new(tls: &TlsMaterial) -> Result<Self, SdError> {
        let connector = MtlsConnector {
            tls: TlsConnector::from(Arc::new(tls.client_config()?)),
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(None::<Duration>)
            .build(connector);
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for MtlsTransport {
    async fn get(&self, uri: &Uri) -> Result<HttpResponse, SdError> {
        let response = self
            .client
            .get(uri.clone())
            .await
            .map_err(SdError::transport)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(SdError::transport)?
            .to_bytes();
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Deserialize)]
struct Registration {
    #[serde(rename = "Hosts", default)]
    hosts: Vec<RegisteredHost>,
}

#[derive(Debug, Deserialize)]
struct RegisteredHost {
    ip_address: String,
}

/// Looks up backend IPs for an application name.
pub struct ServiceDiscoveryClient<T = MtlsTransport> {
    base_url: String,
    transport: T,
    rng: Mutex<StdRng>,
    shutdown: Shutdown,
}

impl ServiceDiscoveryClient<MtlsTransport> {
    /// Client for an `https://` base URL authenticated with `tls`.
    pub fn new(base_url: &str, tls: &TlsMaterial) -> Result<Self, SdError> {
        let uri: Uri = base_url.parse().map_err(|e: http::uri::InvalidUri| SdError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if uri.scheme_str() != Some("https") {
            return Err(SdError::InvalidUrl {
                url: base_url.to_string(),
                reason: "scheme must be https".into(),
            });
        }
        Self::with_transport(base_url, MtlsTransport::new(tls)?)
    }
}

impl<T: HttpTransport> ServiceDiscoveryClient<T> {
    /// Client for `base_url` that sends its requests through `transport`.
    ///
    /// A trailing slash on `base_url` is ignored. Unlike [`new`](ServiceDiscoveryClient::new),
    /// any scheme is accepted.
    pub fn with_transport(base_url: &str, transport: T) -> Result<Self, SdError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let uri: Uri = base_url.parse().map_err(|e: http::uri::InvalidUri| SdError::InvalidUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;
        if uri.authority().is_none() {
            return Err(SdError::InvalidUrl {
                url: base_url,
                reason: "missing host".into(),
            });
        }

        Ok(Self {
            base_url,
            transport,
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown: Shutdown::default(),
        })
    }

    /// Abort pending and future lookups once `shutdown` carries `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Shutdown::new(shutdown);
        self
    }

    /// Replace the entropy-seeded source used for jitter and shuffling.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Backend IPs registered for `name`, in random order.
    pub async fn ips(&self, name: &str) -> Result<Vec<Ipv4Addr>, SdError> {
        let uri = self.registration_uri(name)?;

        let mut attempt = 0;
        loop {
            if self.shutdown.is_triggered() {
                return Err(SdError::Cancelled);
            }

            let response = tokio::select! {
                _ = self.shutdown.triggered() => return Err(SdError::Cancelled),
                result = tokio::time::timeout(REQUEST_TIMEOUT, self.transport.get(&uri)) => {
                    result.map_err(|_| SdError::Timeout(REQUEST_TIMEOUT))??
                }
            };

            if response.status == StatusCode::OK {
                return self.decode(&response.body);
            }

            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                warn!(%name, status = %response.status, attempts = attempt, "service discovery lookup failed");
                return Err(SdError::Status(response.status));
            }

            let delay = self.backoff(attempt - 1);
            debug!(%name, status = %response.status, attempt, ?delay, "retrying service discovery lookup");

            tokio::select! {
                _ = self.shutdown.triggered() => return Err(SdError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn registration_uri(&self, name: &str) -> Result<Uri, SdError> {
        let url = format!("{}/v1/registration/{}", self.base_url, name);
        url.parse().map_err(|e: http::uri::InvalidUri| SdError::InvalidUrl {
            reason: e.to_string(),
            url,
        })
    }

    /// Sleep between attempt `retry` and the next: `500ms * retry` plus
    /// uniform jitter in [50ms, 125ms).
    fn backoff(&self, retry: u32) -> Duration {
        let jitter = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(50..125);
        Duration::from_millis(500 * u64::from(retry) + jitter)
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Ipv4Addr>, SdError> {
        let registration: Registration = serde_json::from_slice(body)?;

        let mut seen = HashSet::new();
        let mut ips = Vec::with_capacity(registration.hosts.len());
        for host in registration.hosts {
            match host.ip_address.parse::<Ipv4Addr>() {
                Ok(ip) if seen.insert(ip) => ips.push(ip),
                Ok(ip) => debug!(%ip, "skipping duplicate host"),
                Err(_) => warn!(ip_address = %host.ip_address, "skipping host with invalid ip"),
            }
        }

        ips.shuffle(&mut *self.rng.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(ips)
    }
}
