//! Byte-level progress reporting for large transfers.
//!
//! A [`ProgressTracker`] wraps one send or receive whose size is known up
//! front and reports a [`ProgressState`] snapshot to a caller-supplied
//! [`ProgressObserver`] after every frame. Snapshots are delivered
//! synchronously, so a slow observer slows the transfer instead of piling
//! up snapshots.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::TransferId;

/// Progress of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    /// Transfer being tracked.
    pub uuid: TransferId,
    /// Total bytes the transfer will move.
    pub total_size: u64,
    /// Bytes moved so far.
    pub completed_size: u64,
}

impl ProgressState {
    /// Returns `true` once every byte has been moved.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.completed_size >= self.total_size
    }
}

/// Receives progress snapshots for uploads and downloads.
///
/// Both hooks default to no-ops; implement the one you care about.
pub trait ProgressObserver: Send + Sync {
    /// Called after each outbound frame of the request is written.
    fn on_request(&self, _state: &ProgressState) {}

    /// Called after each inbound frame of the response is received.
    fn on_response(&self, _state: &ProgressState) {}
}

/// Which half of a call a tracker reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound request frames.
    Request,
    /// Inbound response frames.
    Response,
}

/// Tracks one transfer and forwards snapshots to an observer.
pub struct ProgressTracker {
    state: ProgressState,
    direction: Direction,
    observer: Arc<dyn ProgressObserver>,
    finished: bool,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Starts tracking a transfer of `total_size` bytes.
    #[must_use]
    pub fn new(
        uuid: TransferId,
        total_size: u64,
        direction: Direction,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            state: ProgressState {
                uuid,
                total_size,
                completed_size: 0,
            },
            direction,
            observer,
            finished: false,
        }
    }

    /// Records `bytes` more bytes and emits a snapshot.
    ///
    /// Returns the emitted snapshot, or `None` once the transfer finished
    /// or was aborted.
    pub fn advance(&mut self, bytes: u64) -> Option<ProgressState> {
        let completed = self.state.completed_size.saturating_add(bytes);
        self.update(completed)
    }

    /// Applies an externally computed snapshot (e.g. from the decoder).
    ///
    /// `completed_size` never moves backwards; a smaller value is ignored.
    pub fn observe(&mut self, snapshot: &ProgressState) -> Option<ProgressState> {
        if snapshot.total_size != self.state.total_size {
            self.state.total_size = snapshot.total_size;
        }
        self.update(snapshot.completed_size.max(self.state.completed_size))
    }

    /// Stops reporting; later calls to [`advance`](Self::advance) are no-ops.
    pub fn abort(&mut self) {
        self.finished = true;
    }

    /// Returns `true` once the transfer completed or was aborted.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Latest snapshot.
    #[must_use]
    pub const fn state(&self) -> &ProgressState {
        &self.state
    }

    fn update(&mut self, completed: u64) -> Option<ProgressState> {
        if self.finished {
            return None;
        }
        self.state.completed_size = completed.min(self.state.total_size);
        let snapshot = self.state;
        match self.direction {
            Direction::Request => self.observer.on_request(&snapshot),
            Direction::Response => self.observer.on_response(&snapshot),
        }
        if snapshot.is_complete() {
            self.finished = true;
        }
        Some(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<u64>>,
        responses: Mutex<Vec<u64>>,
    }

    impl ProgressObserver for Recorder {
        fn on_request(&self, state: &ProgressState) {
            if let Ok(mut seen) = self.requests.lock() {
                seen.push(state.completed_size);
            }
        }

        fn on_response(&self, state: &ProgressState) {
            if let Ok(mut seen) = self.responses.lock() {
                seen.push(state.completed_size);
            }
        }
    }

    fn seen(slot: &Mutex<Vec<u64>>) -> Vec<u64> {
        slot.lock().map(|v| v.clone()).unwrap_or_default()
    }

    #[test]
    fn advance_reports_each_frame() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            ProgressTracker::new(TransferId::new(), 10, Direction::Request, recorder.clone());
        let _ = tracker.advance(4);
        let _ = tracker.advance(4);
        let _ = tracker.advance(2);
        assert_eq!(seen(&recorder.requests), vec![4, 8, 10]);
        assert!(seen(&recorder.responses).is_empty());
        assert!(tracker.is_finished());
    }

    #[test]
    fn nothing_reported_after_completion() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            ProgressTracker::new(TransferId::new(), 5, Direction::Response, recorder.clone());
        let _ = tracker.advance(5);
        assert_eq!(tracker.advance(1), None);
        assert_eq!(seen(&recorder.responses), vec![5]);
    }

    #[test]
    fn observe_is_monotonic() {
        let recorder = Arc::new(Recorder::default());
        let id = TransferId::new();
        let mut tracker = ProgressTracker::new(id, 100, Direction::Response, recorder.clone());
        let snap = |completed_size| ProgressState {
            uuid: id,
            total_size: 100,
            completed_size,
        };
        let _ = tracker.observe(&snap(40));
        let _ = tracker.observe(&snap(30));
        let _ = tracker.observe(&snap(100));
        assert_eq!(seen(&recorder.responses), vec![40, 40, 100]);
    }

    #[test]
    fn abort_stops_reporting() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            ProgressTracker::new(TransferId::new(), 10, Direction::Request, recorder.clone());
        tracker.abort();
        assert_eq!(tracker.advance(3), None);
        assert!(seen(&recorder.requests).is_empty());
    }

    #[test]
    fn advance_saturates_at_total() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            ProgressTracker::new(TransferId::new(), 10, Direction::Request, recorder);
        let Some(state) = tracker.advance(25) else {
            panic!("expected snapshot");
        };
        assert_eq!(state.completed_size, 10);
    }
}
