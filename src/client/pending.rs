//! Requests awaiting their reply.
//!
//! Each call is resolved through a `oneshot` sender that is removed from
//! the map before use, so a call resolves at most once no matter how many
//! replies, timeouts, or disconnects race for it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use crate::error::ServiceError;
use crate::protocol::{Direction, ProgressObserver, ProgressState, ProgressTracker};

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Value, ServiceError>;

/// Bookkeeping for one outstanding request.
pub struct PendingCall {
    /// Request id.
    pub id: u32,
    /// Command name, for logs and error mapping.
    pub command: String,
    /// When the call was registered.
    pub created_at: Instant,
    resolver: oneshot::Sender<CallResult>,
    observer: Option<Arc<dyn ProgressObserver>>,
    response_progress: Option<ProgressTracker>,
    sent_generation: Option<u64>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("created_at", &self.created_at)
            .field("sent_generation", &self.sent_generation)
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    /// Delivers the outcome. Returns `false` if the caller stopped waiting.
    pub fn resolve(self, result: CallResult) -> bool {
        self.resolver.send(result).is_ok()
    }
}

/// Table of outstanding requests keyed by id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<u32, PendingCall>>,
}

impl PendingCalls {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers request `id` and returns the receiver its outcome is
    /// delivered on.
    pub async fn register(
        &self,
        id: u32,
        command: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            id,
            command: command.to_string(),
            created_at: Instant::now(),
            resolver: tx,
            observer,
            response_progress: None,
            sent_generation: None,
        };
        self.calls.lock().await.insert(id, call);
        rx
    }

    /// Records the transport generation the request was written to.
    pub async fn mark_sent(&self, id: u32, generation: u64) {
        if let Some(call) = self.calls.lock().await.get_mut(&id) {
            call.sent_generation = Some(generation);
        }
    }

    /// Removes and returns call `id`.
    pub async fn take(&self, id: u32) -> Option<PendingCall> {
        self.calls.lock().await.remove(&id)
    }

    /// Resolves call `id`. Returns `false` if no such call is pending.
    pub async fn resolve(&self, id: u32, result: CallResult) -> bool {
        match self.take(id).await {
            Some(call) => {
                if !call.resolve(result) {
                    tracing::debug!(request_id = id, "caller no longer waiting");
                }
                true
            }
            None => false,
        }
    }

    /// Forgets call `id` without resolving it.
    pub async fn remove(&self, id: u32) -> bool {
        self.take(id).await.is_some()
    }

    /// Forwards a response progress snapshot to call `id`'s observer.
    pub async fn observe_response(&self, id: u32, snapshot: &ProgressState) {
        let mut calls = self.calls.lock().await;
        let Some(call) = calls.get_mut(&id) else {
            return;
        };
        let Some(observer) = call.observer.clone() else {
            return;
        };
        let tracker = call.response_progress.get_or_insert_with(|| {
            ProgressTracker::new(
                snapshot.uuid,
                snapshot.total_size,
                Direction::Response,
                observer,
            )
        });
        tracker.observe(snapshot);
    }

    /// Rejects every pending call with the error built by `make_err`.
    /// Returns how many calls were rejected.
    pub async fn reject_all(&self, make_err: impl Fn() -> ServiceError) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            call.resolve(Err(make_err()));
        }
        count
    }

    /// Rejects calls written to a transport older than `generation`.
    /// Calls not yet written are kept.
    pub async fn reject_sent_before(
        &self,
        generation: u64,
        make_err: impl Fn() -> ServiceError,
    ) -> usize {
        let stale: Vec<PendingCall> = {
            let mut calls = self.calls.lock().await;
            let ids: Vec<u32> = calls
                .values()
                .filter(|c| c.sent_generation.is_some_and(|g| g < generation))
                .map(|c| c.id)
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };
        let count = stale.len();
        for call in stale {
            call.resolve(Err(make_err()));
        }
        count
    }

    /// Rejects every call already written to a transport. Calls still
    /// waiting to be written are kept.
    pub async fn reject_sent(&self, make_err: impl Fn() -> ServiceError) -> usize {
        self.reject_sent_before(u64::MAX, make_err).await
    }

    /// Number of outstanding calls.
    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Returns `true` if nothing is outstanding.
    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let pending = PendingCalls::new();
        let rx = pending.register(1, "user.get", None).await;
        assert!(pending.resolve(1, Ok(json!("first"))).await);
        assert!(!pending.resolve(1, Ok(json!("second"))).await);
        let Ok(Ok(value)) = rx.await else {
            panic!("expected resolution");
        };
        assert_eq!(value, json!("first"));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn removed_call_ignores_late_reply() {
        let pending = PendingCalls::new();
        let _rx = pending.register(2, "slow", None).await;
        assert!(pending.remove(2).await);
        assert!(!pending.resolve(2, Ok(Value::Null)).await);
    }

    #[tokio::test]
    async fn reject_all_drains_table() {
        let pending = PendingCalls::new();
        let rx1 = pending.register(1, "a", None).await;
        let rx2 = pending.register(2, "b", None).await;
        assert_eq!(pending.reject_all(|| ServiceError::ConnectionLost).await, 2);
        assert!(matches!(rx1.await, Ok(Err(ServiceError::ConnectionLost))));
        assert!(matches!(rx2.await, Ok(Err(ServiceError::ConnectionLost))));
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn reject_sent_before_keeps_unsent_and_current() {
        let pending = PendingCalls::new();
        let old = pending.register(1, "old", None).await;
        let _unsent = pending.register(2, "unsent", None).await;
        let _current = pending.register(3, "current", None).await;
        pending.mark_sent(1, 1).await;
        pending.mark_sent(3, 2).await;
        assert_eq!(
            pending
                .reject_sent_before(2, || ServiceError::ConnectionLost)
                .await,
            1
        );
        assert!(matches!(old.await, Ok(Err(ServiceError::ConnectionLost))));
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test]
    async fn reject_sent_keeps_only_unsent() {
        let pending = PendingCalls::new();
        let first = pending.register(1, "first", None).await;
        let second = pending.register(2, "second", None).await;
        let _unsent = pending.register(3, "unsent", None).await;
        pending.mark_sent(1, 1).await;
        pending.mark_sent(2, 4).await;
        assert_eq!(pending.reject_sent(|| ServiceError::ConnectionLost).await, 2);
        assert!(matches!(first.await, Ok(Err(ServiceError::ConnectionLost))));
        assert!(matches!(second.await, Ok(Err(ServiceError::ConnectionLost))));
        assert_eq!(pending.len().await, 1);
        assert!(pending.take(3).await.is_some());
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<u64>>);

    impl ProgressObserver for Recorder {
        fn on_response(&self, state: &ProgressState) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(state.completed_size);
            }
        }
    }

    #[tokio::test]
    async fn response_progress_reaches_observer() {
        let pending = PendingCalls::new();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ProgressObserver> = recorder.clone();
        let _rx = pending.register(7, "download", Some(observer)).await;
        let uuid = crate::protocol::TransferId::reply_to(7);
        for completed_size in [100, 200] {
            let snapshot = ProgressState {
                uuid,
                total_size: 200,
                completed_size,
            };
            pending.observe_response(7, &snapshot).await;
        }
        let seen = recorder.0.lock().map(|v| v.clone()).unwrap_or_default();
        assert_eq!(seen, vec![100, 200]);
    }
}
