//! In-process transport backed by tokio channels.
//!
//! [`memory_listener`] returns a connector/listener pair: every
//! [`MemoryConnector::connect`] hands the far end of a fresh pipe to the
//! [`MemoryListener`], which a server session can serve exactly like an
//! accepted socket. Dropping either half's sink ends the other half's
//! stream, which both sides treat as a lost connection.

use async_trait::async_trait;
use futures_util::{sink, stream};
use tokio::sync::mpsc;

use super::{Connector, TransportError, TransportPair};

/// Creates two connected transports with `capacity` frames of buffering
/// in each direction.
#[must_use]
pub fn memory_pair(capacity: usize) -> (TransportPair, TransportPair) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (half(a_tx, a_rx), half(b_tx, b_rx))
}

fn half(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> TransportPair {
    let sink = sink::unfold(tx, |tx, frame: Vec<u8>| async move {
        tx.send(frame).await.map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    });
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, TransportError>(frame), rx))
    });
    TransportPair {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

/// Creates a connector and the listener that receives its connections.
#[must_use]
pub fn memory_listener(capacity: usize) -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            acceptor: tx,
            capacity,
        },
        MemoryListener { incoming: rx },
    )
}

/// Client side of an in-process listener.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    acceptor: mpsc::UnboundedSender<TransportPair>,
    capacity: usize,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<TransportPair, TransportError> {
        let (client, server) = memory_pair(self.capacity);
        self.acceptor
            .send(server)
            .map_err(|_| TransportError::Connect("memory listener closed".to_string()))?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Server side of an in-process listener.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<TransportPair>,
}

impl MemoryListener {
    /// Waits for the next connection. Returns `None` once every connector
    /// has been dropped.
    pub async fn accept(&mut self) -> Option<TransportPair> {
        self.incoming.recv().await
    }
}
