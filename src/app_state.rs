//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::server::ServerDispatcher;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Request dispatcher shared by every connection.
    pub dispatcher: ServerDispatcher,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Bundles a dispatcher with the configuration it was built from.
    #[must_use]
    pub fn new(dispatcher: ServerDispatcher, config: ServerConfig) -> Self {
        Self {
            dispatcher,
            config: Arc::new(config),
        }
    }
}
