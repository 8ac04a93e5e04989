//! duplex-rpc server entry point.
//!
//! Serves the protocol on `/ws` and a health check on `/health`.

use std::net::SocketAddr;

use anyhow::Context;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use duplex_rpc::api;
use duplex_rpc::app_state::AppState;
use duplex_rpc::config::ServerConfig;
use duplex_rpc::server::{CommandRegistry, ServerDispatcher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(addr = %config.listen_addr, "starting duplex-rpc server");

    let registry = default_commands();
    tracing::info!(commands = ?registry.commands(), "commands registered");
    let dispatcher = ServerDispatcher::new(registry, &config);
    let listen_addr = config.listen_addr;
    let app_state = AppState::new(dispatcher, config);

    let app = api::build_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Commands served by the stock binary.
fn default_commands() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register_fn("ping", |_ctx, _params| async move {
        Ok::<_, anyhow::Error>(json!({ "pong": chrono::Utc::now().to_rfc3339() }))
    });
    registry.register_fn("sum", |_ctx, params: Vec<Value>| async move {
        let mut total = 0.0;
        for (index, param) in params.iter().enumerate() {
            total += param
                .as_f64()
                .with_context(|| format!("param {index} is not a number"))?;
        }
        Ok::<_, anyhow::Error>(json!(total))
    });
    registry.register_fn("whoami", |ctx, _params| async move {
        Ok::<_, anyhow::Error>(json!({
            "connectionId": ctx.connection_id.to_string(),
            "remoteAddr": ctx.remote_addr.map(|addr| addr.to_string()),
        }))
    });
    registry
}
