//! Server-side listener table and event push.
//!
//! [`EventBus`] tracks which connection subscribed to which event name
//! and pushes [`EventPush`] messages to them. Delivery is best-effort and
//! at most once: a push to a connection whose outbound queue is full or
//! closed is dropped, never queued for later. Listeners whose connection
//! is gone are pruned on the next push that reaches them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;

use super::context::{ConnectionId, OutboundSender};
use crate::config::CodecConfig;
use crate::protocol::{EventPush, ListenerInfo, Message, TransferId, encode};

/// A registered listener.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    /// Listener id, unique for the life of the bus.
    pub id: u32,
    /// Event the listener subscribed to.
    pub event_name: String,
    /// Filter metadata supplied by the subscriber.
    pub info: Value,
    /// Connection that owns the listener.
    pub connection_id: ConnectionId,
    outbound: OutboundSender,
}

enum Delivery {
    Queued,
    Dropped,
    Gone,
}

/// Listener table shared by every connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<u32, ListenerEntry>>>,
    next_id: Arc<AtomicU32>,
    codec: CodecConfig,
}

impl EventBus {
    /// Creates an empty bus that encodes pushes with `codec`.
    #[must_use]
    pub fn new(codec: CodecConfig) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
            codec,
        }
    }

    /// Registers a listener and returns its id.
    ///
    /// Returns `None` if the connection's outbound queue is already
    /// closed, so a listener never outlives the teardown of its connection.
    pub async fn add(
        &self,
        connection_id: ConnectionId,
        outbound: OutboundSender,
        event_name: &str,
        info: Value,
    ) -> Option<u32> {
        let mut listeners = self.listeners.write().await;
        if outbound.is_closed() {
            tracing::debug!(event_name, connection_id = %connection_id, "connection gone, listener refused");
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            id,
            event_name: event_name.to_string(),
            info,
            connection_id,
            outbound,
        };
        listeners.insert(id, entry);
        tracing::debug!(listener_id = id, event_name, connection_id = %connection_id, "listener added");
        Some(id)
    }

    /// Removes a listener. Returns `false` if it did not exist.
    pub async fn remove(&self, listener_id: u32) -> bool {
        let removed = self.listeners.write().await.remove(&listener_id).is_some();
        if removed {
            tracing::debug!(listener_id, "listener removed");
        }
        removed
    }

    /// Removes a listener on behalf of `connection_id`. Listeners owned by
    /// other connections are left alone. Returns `false` if nothing was
    /// removed.
    pub async fn remove_owned(&self, connection_id: ConnectionId, listener_id: u32) -> bool {
        let mut listeners = self.listeners.write().await;
        match listeners.get(&listener_id) {
            Some(entry) if entry.connection_id == connection_id => {
                listeners.remove(&listener_id);
                tracing::debug!(listener_id, connection_id = %connection_id, "listener removed");
                true
            }
            Some(entry) => {
                tracing::warn!(
                    listener_id,
                    owner = %entry.connection_id,
                    connection_id = %connection_id,
                    "refusing to remove listener of another connection"
                );
                false
            }
            None => false,
        }
    }

    /// Removes every listener owned by `connection_id`. Returns how many
    /// were removed.
    pub async fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|_, entry| entry.connection_id != connection_id);
        before - listeners.len()
    }

    /// Listeners registered for `event_name`, ordered by id.
    pub async fn listeners_for(&self, event_name: &str) -> Vec<ListenerInfo> {
        let mut found: Vec<ListenerInfo> = self
            .listeners
            .read()
            .await
            .values()
            .filter(|entry| entry.event_name == event_name)
            .map(|entry| ListenerInfo {
                id: entry.id,
                info: entry.info.clone(),
            })
            .collect();
        found.sort_by_key(|listener| listener.id);
        found
    }

    /// Pushes `data` to every listener of `event_name` whose `info`
    /// satisfies `predicate`. Returns the number of pushes queued.
    pub async fn publish<P>(&self, event_name: &str, predicate: P, data: &Value) -> usize
    where
        P: Fn(&Value) -> bool,
    {
        let listeners = self.listeners.read().await;
        let targets = listeners
            .values()
            .filter(|entry| entry.event_name == event_name && predicate(&entry.info));
        let (queued, gone) = self.push_all(targets, data);
        drop(listeners);
        self.prune(&gone).await;
        queued
    }

    /// Pushes `data` to the listeners in `ids`. Unknown ids are skipped.
    /// Returns the number of pushes queued.
    pub async fn emit_to(&self, ids: &[u32], data: &Value) -> usize {
        let listeners = self.listeners.read().await;
        let targets = ids.iter().filter_map(|id| listeners.get(id));
        let (queued, gone) = self.push_all(targets, data);
        drop(listeners);
        self.prune(&gone).await;
        queued
    }

    /// Number of registered listeners.
    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Returns `true` if no listener is registered.
    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }

    fn push_all<'a>(
        &self,
        targets: impl Iterator<Item = &'a ListenerEntry>,
        data: &Value,
    ) -> (usize, Vec<u32>) {
        let mut queued = 0;
        let mut gone = Vec::new();
        for entry in targets {
            match self.push(entry, data) {
                Delivery::Queued => queued += 1,
                Delivery::Dropped => {}
                Delivery::Gone => gone.push(entry.id),
            }
        }
        (queued, gone)
    }

    async fn prune(&self, gone: &[u32]) {
        if gone.is_empty() {
            return;
        }
        let mut listeners = self.listeners.write().await;
        for id in gone {
            if listeners
                .get(id)
                .is_some_and(|entry| entry.outbound.is_closed())
            {
                listeners.remove(id);
                tracing::debug!(listener_id = id, "pruned listener of closed connection");
            }
        }
    }

    fn push(&self, entry: &ListenerEntry, data: &Value) -> Delivery {
        let message = Message::Event(EventPush {
            listener_id: entry.id,
            data: data.clone(),
        });
        let encoded = match encode(&self.codec, TransferId::new(), &message) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(listener_id = entry.id, error = %err, "event could not be encoded");
                return Delivery::Dropped;
            }
        };
        match entry.outbound.try_send(encoded) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    listener_id = entry.id,
                    connection_id = %entry.connection_id,
                    "outbound queue full, dropping event"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(listener_id = entry.id, "connection gone, dropping event");
                Delivery::Gone
            }
        }
    }
}
