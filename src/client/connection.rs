//! Client connection state machine.
//!
//! A [`Connection`] owns at most one open transport at a time and moves
//! between the states of [`ConnectionState`]:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!       ^                         |                    |
//!       |                    open failed        transport lost
//!       |                         v                    v
//!       +---- attempts exhausted --- Reconnecting <----+
//!
//! any state --close()--> Closed (terminal)
//! ```
//!
//! Each transport the connection opens gets a new generation number.
//! Inbound frames are tagged with the generation they arrived on so the
//! reader can drop stale reassembly state after a reconnect.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::reconnect::{OfflineSendPolicy, ReconnectPolicy};
use crate::config::ClientConfig;
use crate::error::{ServiceError, TransportError};
use crate::protocol::{Frame, ProgressTracker};
use crate::transport::{Connector, FrameSink, FrameStream, TransportPair};

const LIFECYCLE_CAPACITY: usize = 64;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no reconnection in progress.
    Disconnected,
    /// First transport is being opened.
    Connecting,
    /// A transport is open.
    Connected,
    /// The transport was lost and the reconnect policy is retrying.
    Reconnecting,
    /// Closed by the caller. Terminal.
    Closed,
}

/// Notification broadcast on every state-relevant event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The first transport opened.
    Connected,
    /// A reconnect attempt is about to start.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A transport opened after a loss.
    Reconnected,
    /// The connection gave up and holds no transport.
    Disconnected,
    /// The reconnect policy ran out of attempts.
    ReconnectExhausted,
    /// The connection was closed by the caller.
    Closed,
}

/// A frame read from the transport.
#[derive(Debug)]
pub struct InboundFrame {
    /// Generation of the transport the frame arrived on.
    pub generation: u64,
    /// Raw frame bytes.
    pub bytes: Vec<u8>,
}

/// Handle to one logical client connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    reconnect: Option<ReconnectPolicy>,
    offline: OfflineSendPolicy,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    send_gate: Mutex<()>,
    writer: Mutex<Option<FrameSink>>,
    waiting: AtomicUsize,
    generation: AtomicU64,
    cancel: CancellationToken,
    inbound: mpsc::Sender<InboundFrame>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("endpoint", &self.shared.connector.describe())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a disconnected connection.
    ///
    /// Returns the connection and the receiver of every inbound frame; the
    /// caller drives decoding from that receiver.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let shared = Shared {
            connector,
            reconnect: config.reconnect.clone().filter(ReconnectPolicy::is_enabled),
            offline: config.offline,
            state,
            lifecycle,
            send_gate: Mutex::new(()),
            writer: Mutex::new(None),
            waiting: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            inbound,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            inbound_rx,
        )
    }

    /// Opens the transport.
    ///
    /// Does nothing if the connection is already connected or connecting.
    /// If the transport cannot be opened the error is returned and, when
    /// a reconnect policy is configured, the connection keeps retrying in
    /// the background from `Reconnecting`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Closed`] after [`close`](Self::close), or
    /// [`ServiceError::Transport`] if the first open fails.
    pub async fn connect(&self) -> Result<(), ServiceError> {
        let shared = &self.shared;
        let started = shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return match self.state() {
                ConnectionState::Closed => Err(ServiceError::Closed),
                _ => Ok(()),
            };
        }

        let endpoint = shared.connector.describe();
        tracing::info!(endpoint = %endpoint, "connecting");
        let opened = tokio::select! {
            () = shared.cancel.cancelled() => return Err(ServiceError::Closed),
            opened = shared.connector.connect() => opened,
        };
        match opened {
            Ok(pair) => {
                shared.install(pair, false).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(endpoint = %endpoint, error = %err, "connect failed");
                let generation = shared.generation.load(Ordering::SeqCst);
                shared.on_transport_lost(generation, err.clone());
                Err(ServiceError::Transport(err))
            }
        }
    }

    /// Writes `frames` in order, advancing `progress` after each one.
    ///
    /// Concurrent calls are written in call order and never interleave.
    /// While the connection is re-establishing, the call waits or fails
    /// according to the [`OfflineSendPolicy`].
    ///
    /// Returns the generation of the transport the frames were written to.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Closed`] after [`close`](Self::close).
    /// - [`ServiceError::NotConnected`] when disconnected, or offline with
    ///   [`OfflineSendPolicy::Reject`].
    /// - [`ServiceError::QueueFull`] when the offline queue is full.
    /// - [`ServiceError::ConnectionLost`] if reconnection gives up while
    ///   the call waits.
    /// - [`ServiceError::Transport`] if a write fails.
    pub async fn send(
        &self,
        frames: &[Frame],
        mut progress: Option<&mut ProgressTracker>,
    ) -> Result<u64, ServiceError> {
        let shared = &self.shared;
        let slot = match self.state() {
            ConnectionState::Closed => return Err(ServiceError::Closed),
            ConnectionState::Disconnected => return Err(ServiceError::NotConnected),
            ConnectionState::Connected => None,
            ConnectionState::Connecting | ConnectionState::Reconnecting => match shared.offline {
                OfflineSendPolicy::Reject => return Err(ServiceError::NotConnected),
                OfflineSendPolicy::Queue { capacity } => {
                    Some(QueueSlot::acquire(&shared.waiting, capacity)?)
                }
            },
        };

        let _gate = shared.send_gate.lock().await;
        self.wait_connected().await?;
        drop(slot);

        let mut writer = shared.writer.lock().await;
        let generation = shared.generation.load(Ordering::SeqCst);
        let Some(sink) = writer.as_mut() else {
            return Err(ServiceError::ConnectionLost);
        };
        for frame in frames {
            let result = sink.send(frame.to_bytes()).await;
            if let Err(err) = result {
                writer.take();
                drop(writer);
                shared.on_transport_lost(generation, err.clone());
                return Err(ServiceError::Transport(err));
            }
            if let Some(tracker) = progress.as_deref_mut() {
                tracker.advance(frame.payload_len() as u64);
            }
        }
        tracing::trace!(frames = frames.len(), generation, "frames written");
        Ok(generation)
    }

    /// Closes the connection for good.
    ///
    /// Cancels any pending reconnect, releases the transport, and moves to
    /// `Closed`. Calling it again is a no-op.
    pub async fn close(&self) {
        let shared = &self.shared;
        let previous = shared.state.send_replace(ConnectionState::Closed);
        shared.cancel.cancel();
        if previous == ConnectionState::Closed {
            return;
        }
        let sink = shared.writer.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(err) = sink.close().await
        {
            tracing::debug!(error = %err, "transport close failed");
        }
        tracing::info!("connection closed");
        let _ = shared.lifecycle.send(LifecycleEvent::Closed);
    }

    /// Moves to `Closed` without waiting for the transport to flush.
    pub(crate) fn shutdown(&self) {
        let shared = &self.shared;
        if shared.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            let _ = shared.lifecycle.send(LifecycleEvent::Closed);
        }
        shared.cancel.cancel();
        if let Ok(mut writer) = shared.writer.try_lock() {
            writer.take();
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribes to lifecycle notifications.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle.subscribe()
    }

    /// Generation of the most recently opened transport (0 before the
    /// first).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Number of senders waiting for the connection to come back.
    #[must_use]
    pub fn queued_senders(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    async fn wait_connected(&self) -> Result<(), ServiceError> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| {
                !matches!(
                    s,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                )
            })
            .await
            .map_err(|_| ServiceError::Closed)?;
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(ServiceError::Closed),
            _ => Err(ServiceError::ConnectionLost),
        }
    }
}

impl Shared {
    async fn install(self: &Arc<Self>, pair: TransportPair, reconnected: bool) {
        let TransportPair { sink, stream } = pair;
        let mut writer = self.writer.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let moved = self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                *state = ConnectionState::Connected;
                true
            }
            _ => false,
        });
        if !moved {
            return;
        }
        *writer = Some(sink);
        drop(writer);

        tracing::info!(generation, reconnected, "connected");
        let event = if reconnected {
            LifecycleEvent::Reconnected
        } else {
            LifecycleEvent::Connected
        };
        let _ = self.lifecycle.send(event);
        tokio::spawn(Arc::clone(self).read_loop(stream, generation));
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, generation: u64) {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let frame = InboundFrame { generation, bytes };
                    if self.inbound.send(frame).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.on_transport_lost(generation, err);
                    return;
                }
                None => {
                    self.on_transport_lost(generation, TransportError::Closed);
                    return;
                }
            }
        }
    }

    /// Reacts to the loss of transport `generation`. Stale reports and
    /// reports after another loss or a close are ignored.
    fn on_transport_lost(self: &Arc<Self>, generation: u64, err: TransportError) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let next = if self.reconnect.is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        let moved = self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                *state = next;
                true
            }
            _ => false,
        });
        if !moved {
            return;
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        tracing::warn!(generation, error = %err, "transport lost");
        if next == ConnectionState::Reconnecting {
            tokio::spawn(Arc::clone(self).reconnect_loop());
        } else {
            let _ = self.lifecycle.send(LifecycleEvent::Disconnected);
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let Some(policy) = self.reconnect.clone() else {
            return;
        };
        let endpoint = self.connector.describe();
        let mut attempt = 0u32;
        loop {
            if policy.is_exhausted(attempt) {
                let moved = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Reconnecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                if moved {
                    tracing::warn!(attempts = attempt, endpoint = %endpoint, "reconnect attempts exhausted");
                    let _ = self.lifecycle.send(LifecycleEvent::Disconnected);
                    let _ = self.lifecycle.send(LifecycleEvent::ReconnectExhausted);
                }
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = policy.delay_for_attempt(attempt);
            let _ = self.lifecycle.send(LifecycleEvent::Reconnecting { attempt });
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::info!(attempt, delay_ms, endpoint = %endpoint, "reconnecting");
            let opened = tokio::select! {
                () = self.cancel.cancelled() => return,
                opened = self.connector.connect() => opened,
            };
            match opened {
                Ok(pair) => {
                    self.install(pair, true).await;
                    return;
                }
                Err(err) => tracing::warn!(attempt, error = %err, "reconnect attempt failed"),
            }
        }
    }
}

/// Reservation in the offline send queue. Released on drop.
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn acquire(counter: &'a AtomicUsize, capacity: usize) -> Result<Self, ServiceError> {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous >= capacity {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(ServiceError::QueueFull { capacity });
        }
        Ok(Self(counter))
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
