//! Adapts an axum [`WebSocket`] to a frame transport and serves it.
//!
//! Binary messages carry protocol frames. A writer task owns the socket's
//! sink and interleaves outgoing frames with heartbeat pings; the read
//! side marks the peer alive on every message and ends when the heartbeat
//! gives up on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt, sink};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatResult, Liveness, run_heartbeat};
use crate::error::TransportError;
use crate::server::{ServerDispatcher, run_session};
use crate::transport::{FrameSink, FrameStream, TransportPair};

/// Heartbeat timing for server-side sockets.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    /// Interval between pings.
    pub interval: Duration,
    /// Silence after which the peer is dropped.
    pub timeout: Duration,
}

enum Outgoing {
    Frame(Vec<u8>),
    Ping,
}

/// Runs the protocol over `socket` until either side goes away.
pub async fn run_connection(
    socket: WebSocket,
    dispatcher: ServerDispatcher,
    heartbeat: HeartbeatSettings,
    remote_addr: Option<SocketAddr>,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Outgoing>(dispatcher.outbound_capacity());
    let liveness = Arc::new(Liveness::new());
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(write_socket(ws_tx, out_rx));
    let monitor = tokio::spawn(monitor(
        Arc::clone(&liveness),
        out_tx.clone(),
        heartbeat,
        cancel.clone(),
        remote_addr,
    ));

    let transport = TransportPair {
        sink: frame_sink(out_tx),
        stream: frame_stream(ws_rx, liveness, cancel.clone()),
    };
    run_session(dispatcher, transport, remote_addr).await;

    cancel.cancel();
    if let Err(err) = monitor.await {
        tracing::error!(error = %err, "heartbeat task failed");
    }
    if let Err(err) = writer.await {
        tracing::error!(error = %err, "socket writer task failed");
    }
}

async fn monitor(
    liveness: Arc<Liveness>,
    pings: mpsc::Sender<Outgoing>,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
    remote_addr: Option<SocketAddr>,
) {
    let send_ping = || match pings.try_send(Outgoing::Ping) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => tracing::debug!("outbound queue full, ping skipped"),
    };
    let result = run_heartbeat(
        &liveness,
        send_ping,
        settings.interval,
        settings.timeout,
        cancel.clone(),
    )
    .await;
    if result == HeartbeatResult::TimedOut {
        tracing::warn!(remote_addr = ?remote_addr, "heartbeat timed out, dropping connection");
        cancel.cancel();
    }
}

fn frame_sink(out_tx: mpsc::Sender<Outgoing>) -> FrameSink {
    Box::pin(sink::unfold(out_tx, |tx, frame: Vec<u8>| async move {
        tx.send(Outgoing::Frame(frame))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    }))
}

fn frame_stream(
    ws_rx: SplitStream<WebSocket>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) -> FrameStream {
    let stream = ws_rx
        .take_until(cancel.cancelled_owned())
        .filter_map(move |message| {
            liveness.mark_alive();
            let item = match message {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes.to_vec())),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(Message::Text(_)) => {
                    tracing::debug!("ignoring text message");
                    None
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => None,
                Err(err) => Some(Err(TransportError::Io(err.to_string()))),
            };
            futures_util::future::ready(item)
        });
    Box::pin(stream)
}

async fn write_socket(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outgoing>,
) {
    while let Some(outgoing) = out_rx.recv().await {
        let message = match outgoing {
            Outgoing::Frame(frame) => Message::Binary(Bytes::from(frame)),
            Outgoing::Ping => Message::Ping(Bytes::new()),
        };
        if let Err(err) = ws_tx.send(message).await {
            tracing::debug!(error = %err, "socket write failed");
            return;
        }
    }
    if let Err(err) = ws_tx.close().await {
        tracing::debug!(error = %err, "socket close failed");
    }
}
