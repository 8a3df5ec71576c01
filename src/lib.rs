//! Library exports for DeeperHub core.
//!
//! The core is a single WebSocket hub: a raw HTTP/1.1 upgrade handshake at
//! `/ws`, a `/health` probe, and nothing else on the HTTP surface. Everything
//! past the handshake is driven by the connection worker in [`ws::worker`].

pub mod app;
pub mod auth;
pub mod broker;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod rate_limit;
pub mod security;
pub mod session;
pub mod telemetry;
pub mod users;
pub mod ws;

pub use app::AppState;
pub use config::{AppConfig, CONFIG};
pub use error::HubError;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::rt::TokioIo;
use tower_http::trace::TraceLayer;

/// Build the two-route HTTP surface (external collaborator): `/health` and
/// the raw `/ws` upgrade endpoint. REST surfaces (registration, channel
/// management over HTTP) belong to a collaborator service, not this core.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use serde_json::json;

    let now = core::now_s();
    let body = json!({
        "status": "healthy",
        "port": state.config.port,
        "max_connections": state.config.max_connections,
        "current_connections": state.connections.current_connections(),
        "uptime_seconds": now.saturating_sub(state.started_at_s),
        "timestamp": core::now_iso(),
    });
    Json(body)
}

/// Handle a raw WebSocket upgrade over hyper's `Upgraded` IO rather than
/// axum's `ws` extractor — the connection runtime hand-rolls its own RFC
/// 6455 frame codec (see `ws::frame`), so this handler's only job is the
/// opening handshake: validate headers, run the request gate, send the 101
/// response, and hand the upgraded socket to `ws::worker::run_connection`.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<axum::body::Body>,
) -> Response {
    let headers = req.headers();
    let connection_header = header_str(headers, header::CONNECTION);
    let upgrade_header = header_str(headers, header::UPGRADE);
    let sec_key = header_str(headers, header::SEC_WEBSOCKET_KEY);

    if !ws::handshake::is_websocket_upgrade(connection_header.as_deref(), upgrade_header.as_deref()) {
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade").into_response();
    }
    let Some(sec_key) = sec_key else {
        return (StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key").into_response();
    };

    let origin = header_str(headers, header::ORIGIN);
    let referer = header_str(headers, header::REFERER);
    let user_agent = header_str(headers, header::USER_AGENT);
    let csrf_token = headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let csrf_session_id = headers
        .get("x-csrf-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let ip = addr.ip().to_string();

    let gate_req = security::UpgradeRequest {
        ip: &ip,
        origin: origin.as_deref(),
        referer: referer.as_deref(),
        user_agent: user_agent.as_deref(),
        csrf_token: csrf_token.as_deref(),
        csrf_session_id: csrf_session_id.as_deref(),
    };
    if let security::FilterOutcome::Deny(err) = state.request_gate.evaluate(&gate_req) {
        let env = err.to_envelope(None);
        return (StatusCode::FORBIDDEN, Json(env)).into_response();
    }

    let accept = ws::handshake::accept_key(&sec_key);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                ws::worker::run_connection(io, state, ip).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "ws_upgrade_failed");
            }
        }
    });

    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers_mut = response.headers_mut();
    headers_mut.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers_mut.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers_mut.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}
