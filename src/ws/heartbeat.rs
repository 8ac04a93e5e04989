//! Ping/pong liveness monitoring for server-side sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

/// Tracks whether the peer has shown signs of life since the last check.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
}

impl Liveness {
    /// Creates a tracker that starts out alive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }

    /// Records traffic from the peer.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Returns whether the peer was alive since the last call, and resets
    /// the flag.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Pings the peer every `interval` until it misses `timeout / interval`
/// consecutive checks (at least one) or `cancel` fires.
pub async fn run_heartbeat<F>(
    liveness: &Liveness,
    mut send_ping: F,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult
where
    F: FnMut(),
{
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.take_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                send_ping();
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn cancelled_before_first_tick() {
        let liveness = Liveness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(
            &liveness,
            || {},
            Duration::from_secs(100),
            Duration::from_secs(300),
            cancel,
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let liveness = Liveness::new();
        let pings = AtomicUsize::new(0);
        let result = run_heartbeat(
            &liveness,
            || {
                pings.fetch_add(1, Ordering::Relaxed);
            },
            Duration::from_millis(10),
            Duration::from_millis(30),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        // first tick consumes the initial alive flag, then three misses
        assert_eq!(pings.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_stays_connected() {
        let liveness = Arc::new(Liveness::new());
        let cancel = CancellationToken::new();
        let heartbeat = {
            let liveness = Arc::clone(&liveness);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_heartbeat(
                    &liveness,
                    || {},
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                    cancel,
                )
                .await
            })
        };

        for _ in 0..10 {
            liveness.mark_alive();
            time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let Ok(result) = heartbeat.await else {
            panic!("heartbeat task failed");
        };
        assert_eq!(result, HeartbeatResult::Cancelled);
    }
}
