//! Client-side event listener table.
//!
//! Subscriptions are keyed by a client-assigned id that stays stable for
//! the life of the client. Each one also remembers the id the server
//! assigned on the transport it was registered on, so events can be
//! routed and the subscription can be registered again after a reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;

/// Callback invoked with the `data` of every event pushed to a listener.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct Subscription {
    event_name: String,
    info: Value,
    callback: EventCallback,
    server_id: u32,
    generation: u64,
}

/// A subscription whose server registration belongs to an older transport.
#[derive(Debug, Clone)]
pub struct StaleSubscription {
    /// Client-side id.
    pub local_id: u32,
    /// Event the subscription listens to.
    pub event_name: String,
    /// Filter data sent with `addEventListener`.
    pub info: Value,
}

#[derive(Default)]
struct Table {
    subscriptions: HashMap<u32, Subscription>,
    routes: HashMap<u32, u32>,
}

/// Maps subscriptions to local callbacks and server-side listener ids.
pub struct ClientListeners {
    table: RwLock<Table>,
    next_id: AtomicU32,
}

impl Default for ClientListeners {
    fn default() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            next_id: AtomicU32::new(1),
        }
    }
}

impl fmt::Debug for ClientListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientListeners")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClientListeners {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a subscription registered on the server as `server_id`
    /// over transport `generation`. Returns the client-side id.
    pub async fn insert(
        &self,
        event_name: &str,
        info: Value,
        callback: EventCallback,
        server_id: u32,
        generation: u64,
    ) -> u32 {
        let local_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.write().await;
        table.routes.insert(server_id, local_id);
        table.subscriptions.insert(
            local_id,
            Subscription {
                event_name: event_name.to_string(),
                info,
                callback,
                server_id,
                generation,
            },
        );
        local_id
    }

    /// Removes subscription `local_id`. Returns the server-side id and the
    /// generation it was registered on.
    pub async fn remove(&self, local_id: u32) -> Option<(u32, u64)> {
        let mut table = self.table.write().await;
        let subscription = table.subscriptions.remove(&local_id)?;
        if table.routes.get(&subscription.server_id) == Some(&local_id) {
            table.routes.remove(&subscription.server_id);
        }
        Some((subscription.server_id, subscription.generation))
    }

    /// Invokes the callback bound to server listener `server_id`. Returns
    /// `false` if none is bound.
    pub async fn dispatch(&self, server_id: u32, data: Value) -> bool {
        let callback = {
            let table = self.table.read().await;
            table
                .routes
                .get(&server_id)
                .and_then(|local_id| table.subscriptions.get(local_id))
                .map(|s| Arc::clone(&s.callback))
        };
        match callback {
            Some(callback) => {
                callback(data);
                true
            }
            None => false,
        }
    }

    /// Unbinds every server id. Subscriptions are kept so they can be
    /// registered again on the next transport.
    pub async fn detach(&self) {
        self.table.write().await.routes.clear();
    }

    /// Subscriptions not registered on transport `generation`.
    pub async fn stale(&self, generation: u64) -> Vec<StaleSubscription> {
        let table = self.table.read().await;
        let mut stale: Vec<StaleSubscription> = table
            .subscriptions
            .iter()
            .filter(|(_, s)| s.generation != generation)
            .map(|(local_id, s)| StaleSubscription {
                local_id: *local_id,
                event_name: s.event_name.clone(),
                info: s.info.clone(),
            })
            .collect();
        stale.sort_by_key(|s| s.local_id);
        stale
    }

    /// Binds subscription `local_id` to a new server id. Returns `false`
    /// if the subscription was removed meanwhile.
    pub async fn rebind(&self, local_id: u32, server_id: u32, generation: u64) -> bool {
        let mut table = self.table.write().await;
        let Some(subscription) = table.subscriptions.get_mut(&local_id) else {
            return false;
        };
        let previous = subscription.server_id;
        subscription.server_id = server_id;
        subscription.generation = generation;
        if table.routes.get(&previous) == Some(&local_id) {
            table.routes.remove(&previous);
        }
        table.routes.insert(server_id, local_id);
        true
    }

    /// Drops every subscription.
    pub async fn clear(&self) {
        let mut table = self.table.write().await;
        table.subscriptions.clear();
        table.routes.clear();
    }

    /// Number of subscriptions.
    pub async fn len(&self) -> usize {
        self.table.read().await.subscriptions.len()
    }

    /// Returns `true` if nothing is subscribed.
    pub async fn is_empty(&self) -> bool {
        self.table.read().await.subscriptions.is_empty()
    }
}
