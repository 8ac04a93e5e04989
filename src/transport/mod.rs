//! Duplex frame transports.
//!
//! A transport is a pair of a [`FrameSink`] and a [`FrameStream`] moving
//! raw frame bytes. The client opens transports through a [`Connector`],
//! which lets the reconnection loop open a fresh one after a failure.
//!
//! - [`websocket::WebSocketConnector`]: `ws://` / `wss://` client.
//! - [`memory`]: channel-backed pipes for in-process use and tests.

pub mod memory;
pub mod websocket;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream};

pub use crate::error::TransportError;
pub use memory::{MemoryConnector, MemoryListener, memory_listener, memory_pair};
pub use websocket::WebSocketConnector;

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;

/// Inbound half of a transport. Ends (`None`) when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// An open transport.
pub struct TransportPair {
    /// Writes frames to the peer.
    pub sink: FrameSink,
    /// Reads frames from the peer.
    pub stream: FrameStream,
}

impl fmt::Debug for TransportPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPair").finish_non_exhaustive()
    }
}

/// Opens new transports on demand.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes a new transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the peer cannot be reached.
    async fn connect(&self) -> Result<TransportPair, TransportError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
