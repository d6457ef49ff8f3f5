//! `/iptables-logging`: read or flip the packet-filter logging flag.
//!
//! The planners read the flag on every poll cycle, so a change shows up in
//! the kernel on the next cycle.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use overlay_policy::LoggingState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct LoggingStatus {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SetLogging {
    enabled: Option<bool>,
}

pub fn logging_router(state: LoggingState) -> Router {
    Router::new()
        .route("/iptables-logging", get(get_logging).put(set_logging))
        .with_state(state)
}

/// GET /iptables-logging
async fn get_logging(State(state): State<LoggingState>) -> Json<LoggingStatus> {
    Json(LoggingStatus {
        enabled: state.is_enabled(),
    })
}

/// PUT /iptables-logging
async fn set_logging(State(state): State<LoggingState>, body: Bytes) -> Response {
    let request: SetLogging = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid iptables logging request");
            return bad_request(&format!("decoding request body: {e}"));
        }
    };
    let Some(enabled) = request.enabled else {
        return bad_request("missing required key 'enabled'");
    };

    state.set(enabled);
    info!(enabled, "iptables logging updated");
    Json(LoggingStatus { enabled }).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(router: Router, method: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri("/iptables-logging")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn get_reports_current_flag() {
        let state = LoggingState::new(true);
        let (status, body) = call(logging_router(state.clone()), "GET", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "enabled": true }));

        state.set(false);
        let (_, body) = call(logging_router(state), "GET", "").await;
        assert_eq!(body, json!({ "enabled": false }));
    }

    #[tokio::test]
    async fn put_sets_flag() {
        let state = LoggingState::default();

        let (status, _) = call(logging_router(state.clone()), "PUT", r#"{"enabled":true}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.is_enabled());

        let (status, body) = call(logging_router(state.clone()), "PUT", r#"{"enabled":false}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "enabled": false }));
        assert!(!state.is_enabled());
    }

    #[tokio::test]
    async fn put_rejects_invalid_json() {
        let state = LoggingState::new(true);
        let (status, body) = call(logging_router(state.clone()), "PUT", "not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("decoding request body: "));
        assert!(state.is_enabled());
    }

    #[tokio::test]
    async fn put_requires_enabled_key() {
        let state = LoggingState::new(true);
        let (status, body) = call(logging_router(state.clone()), "PUT", "{}").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "missing required key 'enabled'" }));
        assert!(state.is_enabled());
    }
}
