//! Per-connection server loop.
//!
//! One session owns one transport. Frames are reassembled on the read
//! side; each complete request runs on its own task so a slow handler
//! never blocks the connection. Replies and event pushes share a single
//! outbound queue drained by a writer task, which keeps the frames of one
//! message contiguous on the wire.
//!
//! Teardown stops the writer before dropping the connection's listeners.
//! Once the outbound queue is closed the event bus refuses new listeners
//! for it, so a request still running cannot register one afterwards.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::context::{ConnectionId, OutboundSender, RequestContext};
use super::dispatcher::ServerDispatcher;
use crate::error::{ServiceError, TransportError};
use crate::protocol::{
    Decoder, Encoded, Message, Reassembled, TransferId, decode_offloaded, encode,
};
use crate::transport::{FrameSink, MemoryListener, TransportPair};

/// Serves one connection until the peer goes away.
pub async fn run_session(
    dispatcher: ServerDispatcher,
    transport: TransportPair,
    remote_addr: Option<SocketAddr>,
) {
    let connection_id = ConnectionId::new();
    let _guard = dispatcher.track_connection();
    let TransportPair { sink, mut stream } = transport;

    let (outbound_tx, outbound_rx) = mpsc::channel::<Encoded>(dispatcher.outbound_capacity());
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, cancel.clone(), connection_id));

    tracing::info!(
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        active = dispatcher.active_connections(),
        "connection opened"
    );

    let ctx = RequestContext::new(connection_id, remote_addr, outbound_tx);
    let mut decoder = Decoder::new(dispatcher.codec());

    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(TransportError::Closed) => break,
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "read failed");
                break;
            }
        };
        match decoder.reassemble(&bytes) {
            Ok(Reassembled::Progress(state)) => {
                tracing::trace!(
                    transfer_id = %state.uuid,
                    completed = state.completed_size,
                    total = state.total_size,
                    "chunk received"
                );
            }
            Ok(Reassembled::Complete { payload, .. }) => {
                tokio::spawn(handle_payload(dispatcher.clone(), ctx.clone(), payload));
            }
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "dropping malformed frame");
                if let Some(transfer_id) = err.transfer_id() {
                    decoder.clear_transfer(&transfer_id);
                }
            }
        }
    }

    cancel.cancel();
    drop(ctx);
    if let Err(err) = writer.await {
        tracing::error!(connection_id = %connection_id, error = %err, "writer task failed");
    }
    let removed = dispatcher.event_bus().remove_connection(connection_id).await;
    tracing::info!(
        connection_id = %connection_id,
        listeners_removed = removed,
        "connection closed"
    );
}

/// Accepts in-memory transports until the connector side is dropped.
pub async fn serve_listener(dispatcher: ServerDispatcher, mut listener: MemoryListener) {
    while let Some(transport) = listener.accept().await {
        tokio::spawn(run_session(dispatcher.clone(), transport, None));
    }
    tracing::debug!("memory listener closed");
}

async fn handle_payload(dispatcher: ServerDispatcher, ctx: RequestContext, payload: Vec<u8>) {
    let message = match decode_offloaded(payload, dispatcher.codec().split_threshold).await {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(connection_id = %ctx.connection_id, error = %err, "undecodable payload");
            return;
        }
    };
    let request = match message {
        Message::Request(request) => request,
        other => {
            tracing::warn!(
                connection_id = %ctx.connection_id,
                kind = other.kind(),
                "unexpected message from client"
            );
            return;
        }
    };

    let request_id = request.id;
    let reply = dispatcher.on_request(&ctx, request).await;
    let Some(encoded) = encode_reply(&dispatcher, request_id, &reply) else {
        return;
    };
    send_outbound(&ctx.outbound, encoded, ctx.connection_id).await;
}

fn encode_reply(dispatcher: &ServerDispatcher, request_id: u32, reply: &Message) -> Option<Encoded> {
    let codec = dispatcher.codec();
    let transfer_id = TransferId::reply_to(request_id);
    match encode(&codec, transfer_id, reply) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            tracing::error!(request_id, error = %err, "reply could not be encoded");
            let fallback = ServiceError::Internal(format!("reply could not be encoded: {err}"));
            encode(&codec, transfer_id, &Message::Error(fallback.to_error_response(request_id))).ok()
        }
    }
}

async fn send_outbound(outbound: &OutboundSender, encoded: Encoded, connection_id: ConnectionId) {
    if outbound.send(encoded).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "connection gone, reply dropped");
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Encoded>,
    cancel: CancellationToken,
    connection_id: ConnectionId,
) {
    loop {
        let encoded = tokio::select! {
            () = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(encoded) => encoded,
                None => break,
            },
        };
        for frame in &encoded.frames {
            if let Err(err) = sink.send(frame.to_bytes()).await {
                tracing::debug!(connection_id = %connection_id, error = %err, "write failed");
                return;
            }
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(connection_id = %connection_id, error = %err, "close failed");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{CodecConfig, ServerConfig};
    use crate::protocol::{Decoded, Request, Response};
    use crate::server::registry::CommandRegistry;
    use crate::transport::memory_pair;
    use serde_json::{Value, json};

    fn dispatcher() -> ServerDispatcher {
        let mut registry = CommandRegistry::new();
        registry.register_fn("double", |_ctx, params: Vec<Value>| async move {
            let n = params.first().and_then(Value::as_i64).unwrap_or_default();
            Ok::<_, anyhow::Error>(json!(n * 2))
        });
        ServerDispatcher::new(registry, &ServerConfig::default())
    }

    async fn send(sink: &mut FrameSink, message: &Message) {
        let Ok(encoded) = encode(&CodecConfig::default(), TransferId::new(), message) else {
            panic!("encode failed");
        };
        for frame in &encoded.frames {
            tokio_test::assert_ok!(sink.send(frame.to_bytes()).await);
        }
    }

    #[tokio::test]
    async fn request_gets_reply() {
        let d = dispatcher();
        let (client, server) = memory_pair(16);
        tokio::spawn(run_session(d.clone(), server, None));
        let TransportPair {
            mut sink,
            mut stream,
        } = client;

        let request = Message::Request(Request {
            id: 7,
            command: "double".into(),
            params: vec![json!(21)],
        });
        send(&mut sink, &request).await;

        let Some(Ok(bytes)) = stream.next().await else {
            panic!("no reply");
        };
        let mut decoder = Decoder::new(CodecConfig::default());
        let Ok(Decoded::Complete(reply)) = decoder.decode(&bytes) else {
            panic!("reply not decodable");
        };
        assert_eq!(
            reply,
            Message::Response(Response {
                request_id: 7,
                body: json!(42)
            })
        );
        assert_eq!(d.active_connections(), 1);
    }

    #[tokio::test]
    async fn closing_transport_drops_listeners() {
        let d = dispatcher();
        let (client, server) = memory_pair(16);
        let session = tokio::spawn(run_session(d.clone(), server, None));
        let TransportPair { mut sink, stream } = client;

        let add = Message::Request(Request {
            id: 1,
            command: crate::protocol::builtin::ADD_EVENT_LISTENER.into(),
            params: vec![json!("tick")],
        });
        send(&mut sink, &add).await;
        let mut stream = stream;
        assert!(stream.next().await.is_some());
        assert_eq!(d.event_bus().len().await, 1);

        drop(sink);
        drop(stream);
        tokio_test::assert_ok!(session.await);
        assert!(d.event_bus().is_empty().await);
        assert_eq!(d.active_connections(), 0);
    }

    #[tokio::test]
    async fn listener_added_during_teardown_is_not_kept() {
        let d = dispatcher();
        let (client, server) = memory_pair(16);
        let session = tokio::spawn(run_session(d.clone(), server, None));
        let TransportPair { mut sink, stream } = client;

        let add = Message::Request(Request {
            id: 1,
            command: crate::protocol::builtin::ADD_EVENT_LISTENER.into(),
            params: vec![json!("tick")],
        });
        send(&mut sink, &add).await;
        drop(sink);
        drop(stream);

        tokio_test::assert_ok!(session.await);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(d.event_bus().is_empty().await);
        assert!(d.event_bus().listeners_for("tick").await.is_empty());
    }
}
