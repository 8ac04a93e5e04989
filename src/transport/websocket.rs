//! WebSocket client transport.
//!
//! Frames travel as binary WebSocket messages. Ping/pong and text messages
//! are absorbed here; a close frame ends the stream with
//! [`TransportError::Closed`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, TransportError, TransportPair};
use crate::config::ClientConfig;

/// Opens WebSocket connections to one URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Creates a connector for an explicit `ws://` or `wss://` URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Creates a connector for the endpoint described by `config`.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.url())
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<TransportPair, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws_tx, ws_rx) = socket.split();

        let sink = ws_tx
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|frame: Vec<u8>| future::ready(Ok::<_, TransportError>(Message::binary(frame))));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes.to_vec())),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });

        tracing::debug!(url = %self.url, "websocket transport opened");
        Ok(TransportPair {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
