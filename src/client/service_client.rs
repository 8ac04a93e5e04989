//! High-level RPC client.
//!
//! [`ServiceClient`] correlates requests with replies over one
//! [`Connection`]. It runs two background tasks: a read loop that
//! reassembles inbound frames and routes the resulting messages, and a
//! state watcher that fails outstanding calls when the connection drops
//! and registers event listeners again once it is back.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, ConnectionState, InboundFrame, LifecycleEvent};
use super::listeners::ClientListeners;
use super::pending::PendingCalls;
use crate::config::ClientConfig;
use crate::error::{CodecError, ServiceError};
use crate::protocol::builtin::{self, ListenerInfo, UploadResult};
use crate::protocol::value::bytes_to_value;
use crate::protocol::{
    Decoder, Direction, Message, ProgressObserver, ProgressState, ProgressTracker, Reassembled,
    Request, TransferId, decode_offloaded, encode,
};
use crate::transport::{Connector, WebSocketConnector};

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Deadline for this call; falls back to
    /// [`ClientConfig::request_timeout`].
    pub timeout: Option<Duration>,
    /// Receives request and response progress of split transfers.
    pub observer: Option<Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("timeout", &self.timeout)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// RPC client over one persistent connection. Cheap to clone.
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: Connection,
    config: ClientConfig,
    next_id: AtomicU32,
    pending: PendingCalls,
    listeners: ClientListeners,
    resubscribing: Mutex<()>,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("connection", &self.inner.connection)
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}

impl ServiceClient {
    /// Connects to the WebSocket endpoint described by `config`.
    ///
    /// # Errors
    ///
    /// See [`ServiceClient::connect_with`].
    pub async fn connect(config: ClientConfig) -> Result<Self, ServiceError> {
        let connector = Arc::new(WebSocketConnector::from_config(&config));
        Self::connect_with(config, connector).await
    }

    /// Connects through an arbitrary [`Connector`].
    ///
    /// If the first open fails but a reconnect policy is configured, the
    /// client is returned in the `Reconnecting` state and requests wait
    /// (or fail) per the offline send policy.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Transport`] if the first open fails and
    /// reconnection is disabled.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ServiceError> {
        let (connection, inbound) = Connection::new(connector, &config);
        let inner = Arc::new(ClientInner {
            connection,
            config,
            next_id: AtomicU32::new(1),
            pending: PendingCalls::new(),
            listeners: ClientListeners::new(),
            resubscribing: Mutex::new(()),
        });

        tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            inbound,
            Decoder::new(inner.config.codec),
            inner.connection.close_token(),
        ));
        tokio::spawn(watch_state(
            Arc::downgrade(&inner),
            inner.connection.watch_state(),
        ));

        let client = Self { inner };
        match client.inner.connection.connect().await {
            Ok(()) => Ok(client),
            Err(err) if client.state() == ConnectionState::Reconnecting => {
                tracing::warn!(error = %err, "initial connect failed; retrying in background");
                Ok(client)
            }
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    /// Invokes `command` and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns the remote error ([`ServiceError::CommandNotFound`],
    /// [`ServiceError::Authorization`], [`ServiceError::Handler`], ...),
    /// [`ServiceError::Timeout`], or a connection error.
    pub async fn send_request(
        &self,
        command: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ServiceError> {
        let options = CallOptions {
            timeout,
            observer: None,
        };
        self.send_request_with(command, params, options).await
    }

    /// Invokes `command` with explicit [`CallOptions`].
    ///
    /// # Errors
    ///
    /// Same as [`ServiceClient::send_request`].
    pub async fn send_request_with(
        &self,
        command: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, ServiceError> {
        self.call(command, params, options)
            .await
            .map(|(body, _generation)| body)
    }

    /// Runs one call and returns its body together with the generation of
    /// the transport the request was written to.
    async fn call(
        &self,
        command: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<(Value, u64), ServiceError> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::Request(Request {
            id,
            command: command.to_string(),
            params,
        });
        let transfer_id = TransferId::new();
        let encoded = encode(&inner.config.codec, transfer_id, &message)?;
        let reply = inner
            .pending
            .register(id, command, options.observer.clone())
            .await;
        tracing::debug!(
            request_id = id,
            command,
            frames = encoded.frames.len(),
            size = encoded.total_size,
            "sending request"
        );

        let exchange = async {
            let mut tracker = match (&options.observer, encoded.is_split()) {
                (Some(observer), true) => Some(ProgressTracker::new(
                    transfer_id,
                    encoded.total_size as u64,
                    Direction::Request,
                    Arc::clone(observer),
                )),
                _ => None,
            };
            let generation = inner
                .connection
                .send(&encoded.frames, tracker.as_mut())
                .await?;
            inner.pending.mark_sent(id, generation).await;
            // the transport may have dropped before the call was marked sent
            if !inner.is_current(generation) && inner.pending.remove(id).await {
                return Err(ServiceError::ConnectionLost);
            }
            let body = reply.await.unwrap_or(Err(ServiceError::ConnectionLost))?;
            Ok((body, generation))
        };

        let result = match options.timeout.or(inner.config.request_timeout) {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(request_id = id, command, timeout_ms, "request timed out");
                    Err(ServiceError::Timeout {
                        command: command.to_string(),
                        timeout_ms,
                    })
                }
            },
            None => exchange.await,
        };
        if result.is_err() {
            inner.pending.remove(id).await;
        }
        result
    }

    /// Registers a listener for `event_name` and returns its id.
    ///
    /// `info` is stored on the server and used by emitters to pick
    /// recipients. `callback` runs on the client's read loop.
    ///
    /// The returned id is assigned by the client and survives reconnects:
    /// after a transport is replaced the listener is registered on the
    /// server again with the same `event_name` and `info`.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying `addEventListener` call.
    pub async fn subscribe<F>(
        &self,
        event_name: &str,
        info: Value,
        callback: F,
    ) -> Result<u32, ServiceError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (body, generation) = self
            .call(
                builtin::ADD_EVENT_LISTENER,
                vec![json!(event_name), info.clone()],
                CallOptions::default(),
            )
            .await?;
        let server_id = listener_id_from(&body)?;
        let inner = &self.inner;
        let listener_id = inner
            .listeners
            .insert(event_name, info, Arc::new(callback), server_id, generation)
            .await;
        tracing::debug!(listener_id, server_id, event_name, "subscribed");
        if !inner.is_current(generation) {
            tokio::spawn(Arc::clone(inner).resubscribe());
        }
        Ok(listener_id)
    }

    /// Removes a listener locally and on the server.
    ///
    /// Unknown ids are ignored. A listener whose server registration went
    /// away with an earlier transport is only removed locally.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying `removeEventListener` call.
    pub async fn unsubscribe(&self, listener_id: u32) -> Result<(), ServiceError> {
        let Some((server_id, generation)) = self.inner.listeners.remove(listener_id).await else {
            tracing::debug!(listener_id, "unsubscribe of unknown listener");
            return Ok(());
        };
        if self.inner.is_current(generation) {
            self.send_request(
                builtin::REMOVE_EVENT_LISTENER,
                vec![json!(server_id)],
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Pushes `data` to every listener of `event_name` whose `info`
    /// matches `filter`. Returns the number of listeners selected.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying `getEventListeners` or
    /// `emitEvent` calls.
    pub async fn emit<F>(
        &self,
        event_name: &str,
        filter: F,
        data: Value,
    ) -> Result<usize, ServiceError>
    where
        F: Fn(&Value) -> bool,
    {
        let body = self
            .send_request(builtin::GET_EVENT_LISTENERS, vec![json!(event_name)], None)
            .await?;
        let listeners: Vec<ListenerInfo> =
            serde_json::from_value(body).map_err(CodecError::from)?;
        let ids: Vec<u32> = listeners
            .into_iter()
            .filter(|listener| filter(&listener.info))
            .map(|listener| listener.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        self.send_request(builtin::EMIT_EVENT, vec![json!(ids), data], None)
            .await?;
        Ok(count)
    }

    /// Uploads `bytes` to the server's upload directory as `filename`.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying `upload` call, or
    /// [`ServiceError::Codec`] if the reply is malformed.
    pub async fn upload(
        &self,
        filename: &str,
        bytes: &[u8],
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<UploadResult, ServiceError> {
        let options = CallOptions {
            timeout: None,
            observer,
        };
        let body = self
            .send_request_with(
                builtin::UPLOAD,
                vec![json!(filename), bytes_to_value(bytes)],
                options,
            )
            .await?;
        Ok(serde_json::from_value(body).map_err(CodecError::from)?)
    }

    /// Closes the connection and fails every outstanding call with
    /// [`ServiceError::Closed`].
    pub async fn close(&self) {
        self.inner.connection.close().await;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watches connection state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    /// Subscribes to lifecycle notifications.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.connection.lifecycle()
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Number of calls awaiting a reply.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.len().await
    }
}

impl ClientInner {
    /// Whether `generation` is the live, connected transport.
    fn is_current(&self, generation: u64) -> bool {
        self.connection.state() == ConnectionState::Connected
            && self.connection.generation() == generation
    }

    /// Registers every listener that is not bound on the current transport.
    async fn resubscribe(self: Arc<Self>) {
        let _running = self.resubscribing.lock().await;
        let generation = self.connection.generation();
        let stale = self.listeners.stale(generation).await;
        if stale.is_empty() {
            return;
        }
        let client = ServiceClient {
            inner: Arc::clone(&self),
        };
        let mut restored = 0usize;
        for subscription in stale {
            let params = vec![json!(subscription.event_name), subscription.info];
            let registered = client
                .call(builtin::ADD_EVENT_LISTENER, params, CallOptions::default())
                .await
                .and_then(|(body, sent)| listener_id_from(&body).map(|id| (id, sent)));
            let (server_id, sent) = match registered {
                Ok(registered) => registered,
                Err(err) => {
                    tracing::warn!(
                        listener_id = subscription.local_id,
                        event_name = %subscription.event_name,
                        error = %err,
                        "failed to register listener again"
                    );
                    if err.is_fatal() {
                        break;
                    }
                    continue;
                }
            };
            if self.listeners.rebind(subscription.local_id, server_id, sent).await {
                restored += 1;
            } else {
                // unsubscribed while the registration was in flight
                let _ = client
                    .send_request(builtin::REMOVE_EVENT_LISTENER, vec![json!(server_id)], None)
                    .await;
            }
        }
        tracing::info!(restored, generation, "listeners registered on new transport");
    }

    async fn on_frame(&self, decoder: &mut Decoder, bytes: &[u8]) {
        match decoder.reassemble(bytes) {
            Ok(Reassembled::Progress(state)) => self.on_response_progress(&state).await,
            Ok(Reassembled::Complete { payload, progress }) => {
                if let Some(state) = &progress {
                    self.on_response_progress(state).await;
                }
                match decode_offloaded(payload, self.config.codec.split_threshold).await {
                    Ok(message) => self.on_message(message).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable message");
                        if let Some(id) = progress.and_then(|p| p.uuid.replied_request()) {
                            self.pending.resolve(id, Err(err)).await;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
                if let Some(id) = err.transfer_id().and_then(|t| t.replied_request()) {
                    self.pending.resolve(id, Err(err.into())).await;
                }
            }
        }
    }

    async fn on_response_progress(&self, state: &ProgressState) {
        if let Some(id) = state.uuid.replied_request() {
            tracing::trace!(
                request_id = id,
                completed = state.completed_size,
                total = state.total_size,
                "response progress"
            );
            self.pending.observe_response(id, state).await;
        }
    }

    async fn on_message(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let id = response.request_id;
                if self.pending.resolve(id, Ok(response.body)).await {
                    tracing::debug!(request_id = id, "response received");
                } else {
                    tracing::warn!(request_id = id, "discarding unmatched response");
                }
            }
            Message::Error(response) => {
                let id = response.request_id;
                match self.pending.take(id).await {
                    Some(call) => {
                        let err = ServiceError::from_error_response(&call.command, response);
                        tracing::debug!(request_id = id, command = %call.command, error = %err, "error response received");
                        call.resolve(Err(err));
                    }
                    None => tracing::warn!(request_id = id, "discarding unmatched error response"),
                }
            }
            Message::Event(event) => {
                let listener_id = event.listener_id;
                if !self.listeners.dispatch(listener_id, event.data).await {
                    tracing::debug!(listener_id, "event for unknown listener");
                }
            }
            Message::Request(request) => {
                tracing::warn!(
                    request_id = request.id,
                    command = %request.command,
                    "client does not serve requests"
                );
            }
        }
    }

    async fn on_state(self: &Arc<Self>, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let generation = self.connection.generation();
                let lost = self
                    .pending
                    .reject_sent_before(generation, || ServiceError::ConnectionLost)
                    .await;
                if lost > 0 {
                    tracing::warn!(lost, generation, "requests lost with previous transport");
                }
                if !self.listeners.is_empty().await {
                    tokio::spawn(Arc::clone(self).resubscribe());
                }
            }
            ConnectionState::Reconnecting => {
                // replies to calls already written cannot arrive on a new transport
                let lost = self
                    .pending
                    .reject_sent(|| ServiceError::ConnectionLost)
                    .await;
                if lost > 0 {
                    tracing::warn!(lost, "requests lost with transport");
                }
                self.listeners.detach().await;
            }
            ConnectionState::Disconnected => {
                self.listeners.detach().await;
                let lost = self
                    .pending
                    .reject_all(|| ServiceError::ConnectionLost)
                    .await;
                if lost > 0 {
                    tracing::warn!(lost, "connection lost with requests outstanding");
                }
            }
            ConnectionState::Closed => {
                self.listeners.clear().await;
                self.pending.reject_all(|| ServiceError::Closed).await;
            }
            ConnectionState::Connecting => {}
        }
    }
}

fn listener_id_from(body: &Value) -> Result<u32, ServiceError> {
    body.as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| ServiceError::Internal(format!("invalid listener id: {body}")))
}

async fn read_loop(
    inner: Weak<ClientInner>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    mut decoder: Decoder,
    closed: CancellationToken,
) {
    let mut generation = 0;
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => break,
            frame = inbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if frame.generation != generation {
            if decoder.pending_transfers() > 0 {
                tracing::debug!(
                    dropped = decoder.pending_transfers(),
                    "discarding partial transfers from previous transport"
                );
            }
            decoder.clear();
            generation = frame.generation;
        }
        inner.on_frame(&mut decoder, &frame.bytes).await;
    }
    tracing::debug!("client read loop stopped");
}

async fn watch_state(inner: Weak<ClientInner>, mut rx: watch::Receiver<ConnectionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_state(state).await;
        if state == ConnectionState::Closed {
            return;
        }
    }
}
