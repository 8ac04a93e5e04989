//! HTTP routes next to the WebSocket endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    connections: usize,
}

/// `GET /health`: service status and open connection count.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: state.dispatcher.active_connections(),
        }),
    )
}

/// Builds the router serving `/health` and `/ws`.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
}
