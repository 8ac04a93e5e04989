//! Shared fixtures for the end-to-end tests.

#![allow(dead_code, clippy::panic)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use duplex_rpc::client::ServiceClient;
use duplex_rpc::config::{ClientConfig, ServerConfig};
use duplex_rpc::protocol::value::bytes_to_value;
use duplex_rpc::protocol::{ProgressObserver, ProgressState};
use duplex_rpc::server::{CommandRegistry, ServerDispatcher, serve_listener};
use duplex_rpc::transport::{
    Connector, MemoryConnector, TransportError, TransportPair, memory_listener,
};

/// Commands every test server knows.
pub fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register_fn("double", |_ctx, params: Vec<Value>| async move {
        let n = params
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
        Ok::<_, anyhow::Error>(json!(n * 2))
    });
    registry.register_fn("slow", |_ctx, params: Vec<Value>| async move {
        let ms = params.first().and_then(Value::as_u64).unwrap_or(200);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok::<_, anyhow::Error>(json!("late"))
    });
    registry.register_fn("blob", |_ctx, params: Vec<Value>| async move {
        let len = params
            .first()
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        Ok::<_, anyhow::Error>(bytes_to_value(&vec![0xAB; len]))
    });
    registry.register_with_permissions("admin.reset", &["admin"], Admin);
    registry
}

struct Admin;

#[async_trait]
impl duplex_rpc::server::CommandHandler for Admin {
    async fn handle(
        &self,
        _ctx: &duplex_rpc::server::RequestContext,
        _params: Vec<Value>,
    ) -> anyhow::Result<Value> {
        Ok(json!("reset"))
    }
}

/// Starts an in-process server and returns a connector to it.
pub fn start_server(config: &ServerConfig) -> (ServerDispatcher, MemoryConnector) {
    start_server_with(ServerDispatcher::new(registry(), config))
}

/// Serves `dispatcher` on a fresh in-memory listener.
pub fn start_server_with(dispatcher: ServerDispatcher) -> (ServerDispatcher, MemoryConnector) {
    let (connector, listener) = memory_listener(64);
    tokio::spawn(serve_listener(dispatcher.clone(), listener));
    (dispatcher, connector)
}

/// Client settings without reconnection.
pub fn client_config() -> ClientConfig {
    ClientConfig {
        reconnect: None,
        ..ClientConfig::default()
    }
}

/// Connects a client to `connector`.
pub async fn connect(config: ClientConfig, connector: MemoryConnector) -> ServiceClient {
    let Ok(client) = ServiceClient::connect_with(config, Arc::new(connector)).await else {
        panic!("client failed to connect");
    };
    client
}

/// Wraps a [`MemoryConnector`] so tests can cut the live transport and
/// refuse new ones, recording when each connect was attempted.
pub struct FlakyConnector {
    inner: MemoryConnector,
    pub refuse: AtomicBool,
    pub attempts: Mutex<Vec<Instant>>,
    cut: Mutex<CancellationToken>,
}

impl FlakyConnector {
    pub fn new(inner: MemoryConnector) -> Self {
        Self {
            inner,
            refuse: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            cut: Mutex::new(CancellationToken::new()),
        }
    }

    /// Ends the inbound stream of the current transport.
    pub fn cut(&self) {
        if let Ok(token) = self.cut.lock() {
            token.cancel();
        }
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> Result<TransportPair, TransportError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(Instant::now());
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused".into()));
        }
        let pair = self.inner.connect().await?;
        let token = CancellationToken::new();
        if let Ok(mut cut) = self.cut.lock() {
            *cut = token.clone();
        }
        Ok(TransportPair {
            sink: pair.sink,
            stream: Box::pin(pair.stream.take_until(token.cancelled_owned())),
        })
    }
}

/// Records every progress snapshot it sees.
#[derive(Default)]
pub struct Recorder {
    pub requests: Mutex<Vec<ProgressState>>,
    pub responses: Mutex<Vec<ProgressState>>,
}

impl Recorder {
    pub fn requests(&self) -> Vec<ProgressState> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn responses(&self) -> Vec<ProgressState> {
        self.responses.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ProgressObserver for Recorder {
    fn on_request(&self, state: &ProgressState) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(*state);
        }
    }

    fn on_response(&self, state: &ProgressState) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(*state);
        }
    }
}
