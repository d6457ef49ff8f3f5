//! DNS-adapter endpoint.
//!
//! The local DNS server forwards queries for overlay names here and expects a
//! DNS-over-JSON style body back. Only `A` queries (`type=1`) are answered.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use overlay_metrics::MetricsSink;
use overlay_vip::Resolver;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

pub const METRIC_REQUEST_FAILURES: &str = "DNSRequestFailures";

const TYPE_A: u16 = 1;
const RCODE_SUCCESS: u8 = 0;
const RCODE_SERVER_FAILURE: u8 = 2;

#[derive(Clone)]
pub struct DnsState {
    pub resolver: Arc<Resolver>,
    pub metrics: Arc<dyn MetricsSink>,
}

#[derive(Debug, Deserialize)]
struct DnsQuery {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
struct Question {
    name: String,
    #[serde(rename = "type")]
    kind: u16,
}

#[derive(Debug, Serialize)]
struct Record {
    name: String,
    #[serde(rename = "type")]
    kind: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DnsResponse {
    status: u8,
    #[serde(rename = "TC")]
    tc: bool,
    #[serde(rename = "RD")]
    rd: bool,
    #[serde(rename = "RA")]
    ra: bool,
    #[serde(rename = "AD")]
    ad: bool,
    #[serde(rename = "CD")]
    cd: bool,
    question: Vec<Question>,
    answer: Vec<Record>,
    additional: Vec<Record>,
    #[serde(rename = "edns_client_subnet")]
    edns_client_subnet: &'static str,
}

impl DnsResponse {
    fn new(status: u8, name: &str, kind: u16, addresses: Vec<String>) -> Self {
        let answer = addresses
            .into_iter()
            .map(|data| Record {
                name: name.to_string(),
                kind: TYPE_A,
                ttl: 0,
                data,
            })
            .collect();
        Self {
            status,
            tc: false,
            rd: false,
            ra: false,
            ad: false,
            cd: false,
            question: vec![Question {
                name: name.to_string(),
                kind,
            }],
            answer,
            additional: Vec::new(),
            edns_client_subnet: "0.0.0.0/0",
        }
    }
}

pub fn dns_router(state: DnsState) -> Router {
    Router::new()
        .route("/", get(get_ip))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health
async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /?name=<fqdn>&type=<n>
async fn get_ip(State(state): State<DnsState>, Query(query): Query<DnsQuery>) -> Response {
    let kind = query.kind.as_deref().filter(|k| !k.is_empty()).unwrap_or("1");
    if kind != "1" {
        debug!(name = %query.name, %kind, "unsupported record type");
        // Non-numeric types are echoed back as 0.
        let kind = kind.parse().unwrap_or(0);
        return Json(DnsResponse::new(RCODE_SUCCESS, &query.name, kind, Vec::new())).into_response();
    }

    if query.name.is_empty() {
        debug!("name parameter empty");
        return (
            StatusCode::BAD_REQUEST,
            Json(DnsResponse::new(RCODE_SERVER_FAILURE, "", TYPE_A, Vec::new())),
        )
            .into_response();
    }

    match state.resolver.resolve(&query.name).await {
        Ok(answer) => {
            let addresses = answer.addresses();
            debug!(name = %query.name, ips = %addresses.join(","), "resolved");
            Json(DnsResponse::new(RCODE_SUCCESS, &query.name, TYPE_A, addresses)).into_response()
        }
        Err(e) => {
            if e.is_transient() {
                warn!(name = %query.name, error = %e, "resolving name, backend unavailable");
            } else {
                error!(name = %query.name, error = %e, "resolving name");
            }
            state.metrics.increment_counter(METRIC_REQUEST_FAILURES);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use overlay_metrics::RecordingSink;
    use overlay_vip::{BackendLookup, ControlPlaneError, SdError, VipLookup, VipProvider};
    use serde_json::{Value, json};
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    struct FixedBackends(Option<Vec<Ipv4Addr>>);

    #[async_trait]
    impl BackendLookup for FixedBackends {
        async fn ips(&self, _name: &str) -> Result<Vec<Ipv4Addr>, SdError> {
            self.0
                .clone()
                .ok_or(SdError::Status(axum::http::StatusCode::BAD_GATEWAY))
        }
    }

    struct DownControlPlane;

    #[async_trait]
    impl VipLookup for DownControlPlane {
        async fn ip(&self, _fqdn: &str) -> Result<String, ControlPlaneError> {
            Err(ControlPlaneError::Rpc(tonic::Status::unavailable("connection refused")))
        }
    }

    fn state(backends: Option<Vec<Ipv4Addr>>) -> (DnsState, Arc<RecordingSink>) {
        let vips = VipProvider::new("127.128.0.0/9".parse().unwrap());
        let resolver = Resolver::new(vips, "apps.internal", Arc::new(FixedBackends(backends)));
        let metrics = Arc::new(RecordingSink::new());
        let state = DnsState {
            resolver: Arc::new(resolver),
            metrics: metrics.clone(),
        };
        (state, metrics)
    }

    async fn get(state: DnsState, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = dns_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn envelope(status: u8, name: &str, kind: u16, answer: Value) -> Value {
        json!({
            "Status": status,
            "TC": false,
            "RD": false,
            "RA": false,
            "AD": false,
            "CD": false,
            "Question": [{ "name": name, "type": kind }],
            "Answer": answer,
            "Additional": [],
            "edns_client_subnet": "0.0.0.0/0",
        })
    }

    #[tokio::test]
    async fn health_returns_empty_ok() {
        let (state, _) = state(Some(vec![]));
        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn answers_backend_ips() {
        let (state, _) = state(Some(vec![Ipv4Addr::new(192, 168, 0, 1)]));
        let (status, body) = get(state, "/?name=app-id.sd-local.&type=1").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            envelope(
                0,
                "app-id.sd-local.",
                1,
                json!([{ "name": "app-id.sd-local.", "type": 1, "TTL": 0, "data": "192.168.0.1" }]),
            )
        );
    }

    #[tokio::test]
    async fn type_defaults_to_a() {
        let (state, _) = state(Some(vec![Ipv4Addr::new(10, 0, 0, 1)]));
        let (status, body) = get(state, "/?name=app.sd-local.").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["Question"][0]["type"], 1);
        assert_eq!(body["Answer"][0]["data"], "10.0.0.1");
    }

    #[tokio::test]
    async fn internal_names_get_a_vip() {
        let (state, _) = state(None);
        let (status, body) = get(state, "/?name=potato.apps.internal.&type=1").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["Answer"].as_array().unwrap().len(), 1);
        let ip: Ipv4Addr = body["Answer"][0]["data"].as_str().unwrap().parse().unwrap();
        assert!(ip.octets()[0] == 127 && ip.octets()[1] >= 128);
    }

    #[tokio::test]
    async fn unsupported_type_is_empty_success() {
        let (state, _) = state(None);
        let (status, body) = get(state, "/?name=app.sd-local.&type=28").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, envelope(0, "app.sd-local.", 28, json!([])));
    }

    #[tokio::test]
    async fn missing_name_is_servfail() {
        let (state, _) = state(None);
        let (status, body) = get(state, "/?type=1").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, envelope(2, "", 1, json!([])));
    }

    #[tokio::test]
    async fn resolver_error_is_500_and_counted() {
        let (state, metrics) = state(None);
        let (status, body) = get(state, "/?name=app.sd-local.&type=1").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "could not connect to service discovery controller: \
             received non-successful response from server: 502 Bad Gateway"
        );
        assert_eq!(metrics.counter(METRIC_REQUEST_FAILURES), 1);
    }

    #[tokio::test]
    async fn control_plane_outage_is_500_and_counted() {
        let vips = VipProvider::new("127.128.0.0/9".parse().unwrap());
        let resolver = Resolver::new(vips, "apps.internal", Arc::new(FixedBackends(None)))
            .with_control_plane(Arc::new(DownControlPlane));
        let metrics = Arc::new(RecordingSink::new());
        let state = DnsState {
            resolver: Arc::new(resolver),
            metrics: metrics.clone(),
        };

        let (status, body) = get(state, "/?name=app.istio.local.&type=1").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with("could not connect to control plane: "), "{body}");
        assert_eq!(metrics.counter(METRIC_REQUEST_FAILURES), 1);
    }
}
