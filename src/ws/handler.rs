//! Axum WebSocket upgrade handler.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;

use super::connection::{HeartbeatSettings, run_connection};
use crate::app_state::AppState;
use crate::protocol::frame::SPLIT_HEADER_LEN;

/// `GET /ws`: upgrades the HTTP connection and serves the protocol on it.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    let heartbeat = HeartbeatSettings {
        interval: state.config.heartbeat_interval,
        timeout: state.config.heartbeat_timeout,
    };
    // Whole frames stay below the split threshold; chunks below chunk size.
    let frame_limit = state
        .config
        .codec
        .split_threshold
        .max(state.config.codec.chunk_size)
        .saturating_add(SPLIT_HEADER_LEN + 1);

    ws.max_message_size(frame_limit)
        .max_frame_size(frame_limit)
        .on_upgrade(move |socket| run_connection(socket, dispatcher, heartbeat, Some(remote_addr)))
}
