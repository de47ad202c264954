//! HTTP surface: client config, health/metrics, WebSocket upgrades, and
//! the SPA fallback.

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::{StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::broker::{Broker, handle_control_socket, handle_data_socket};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(config_handler))
        .route("/api/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/ws/control", get(control_ws_handler))
        .route("/ws/terminal", get(terminal_ws_handler))
        // Everything else under /ws is reserved for upgrades and serves
        // nothing.
        .route("/ws", get(ws_not_found))
        .route("/ws/{*rest}", get(ws_not_found))
        .fallback(get(spa_fallback))
        .with_state(state)
}

/// Client bootstrap config. Never discloses the token or password.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    password_required: bool,
    scrollback_lines: u32,
    poll_interval_ms: u64,
}

async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.broker.config;
    Json(ConfigResponse {
        password_required: state.broker.auth.requires_password(),
        scrollback_lines: config.scrollback_lines,
        poll_interval_ms: config.poll_interval.as_millis() as u64,
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.broker.metrics.snapshot();
    let status = if snapshot.errors.gateway == 0 && snapshot.errors.pty == 0 {
        "healthy"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "clients": snapshot.clients,
        "connections": snapshot.connections,
        "uptime_secs": snapshot.uptime_secs,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broker.metrics.snapshot())
}

async fn control_ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => {
            let broker = state.broker.clone();
            ws.on_upgrade(move |socket| handle_control_socket(socket, broker))
        }
        // Plain GET on an upgrade path.
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn terminal_ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => {
            let broker = state.broker.clone();
            ws.on_upgrade(move |socket| handle_data_socket(socket, broker))
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// SPA fallback: serve the requested asset when it exists, otherwise
/// `index.html`; a missing build is a 500.
async fn spa_fallback(State(state): State<AppState>, uri: Uri) -> Response {
    serve_frontend(&state.broker.config.frontend_dir, uri.path()).await
}

pub(crate) async fn serve_frontend(frontend_dir: &Path, path: &str) -> Response {
    let rel = path.trim_start_matches('/');
    if !rel.is_empty() && !rel.contains("..") {
        let candidate = frontend_dir.join(rel);
        if candidate.is_file() {
            if let Ok(data) = tokio::fs::read(&candidate).await {
                return ([(header::CONTENT_TYPE, content_type_for(rel))], data).into_response();
            }
        }
    }

    match tokio::fs::read(frontend_dir.join("index.html")).await {
        Ok(data) => Html(data).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Frontend not built").into_response(),
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
