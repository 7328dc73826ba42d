//! Typing indicator state with automatic expiry.
//!
//! A peer that stops sending indicators (crash, dropped channel) must not
//! stay "typing" forever, so every set carries an explicit expiry timer.
//! Timer handles are stored per peer and aborted on replacement or
//! teardown, never leaked.

use super::manager::PeerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// How long a typing indicator stays active without renewal.
pub const TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

pub(crate) struct TypingTracker {
    state: Arc<TypingState>,
}

struct TypingState {
    timeout: Duration,
    event_tx: broadcast::Sender<PeerEvent>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TypingTracker {
    pub(crate) fn new(event_tx: broadcast::Sender<PeerEvent>, timeout: Duration) -> Self {
        Self {
            state: Arc::new(TypingState {
                timeout,
                event_tx,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Apply an inbound typing indicator for `peer_id`.
    pub(crate) async fn set_typing(&self, peer_id: &str, is_typing: bool) {
        let mut timers = self.state.timers.lock().await;
        if let Some(timer) = timers.remove(peer_id) {
            timer.abort();
        }

        let _ = self.state.event_tx.send(PeerEvent::TypingChanged {
            peer_id: peer_id.to_string(),
            is_typing,
        });

        if is_typing {
            let state = self.state.clone();
            let peer_id = peer_id.to_string();
            timers.insert(
                peer_id.clone(),
                tokio::spawn(async move {
                    tokio::time::sleep(state.timeout).await;
                    state.timers.lock().await.remove(&peer_id);
                    let _ = state.event_tx.send(PeerEvent::TypingChanged {
                        peer_id,
                        is_typing: false,
                    });
                }),
            );
        }
    }

    /// Drop any pending indicator for a departing peer.
    pub(crate) async fn clear(&self, peer_id: &str) {
        if let Some(timer) = self.state.timers.lock().await.remove(peer_id) {
            timer.abort();
        }
    }

    /// Abort all timers.
    pub(crate) async fn shutdown(&self) {
        let mut timers = self.state.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(timeout: Duration) -> (TypingTracker, broadcast::Receiver<PeerEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (TypingTracker::new(tx, timeout), rx)
    }

    async fn next_typing(rx: &mut broadcast::Receiver<PeerEvent>) -> (String, bool) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event before deadline")
                .expect("channel open")
            {
                PeerEvent::TypingChanged { peer_id, is_typing } => return (peer_id, is_typing),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_typing_auto_expires() {
        let (tracker, mut rx) = tracker(Duration::from_millis(20));

        tracker.set_typing("alice", true).await;
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), true));

        // Expiry fires without any further input.
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), false));
    }

    #[tokio::test]
    async fn test_renewal_replaces_timer() {
        let (tracker, mut rx) = tracker(Duration::from_millis(40));

        tracker.set_typing("alice", true).await;
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), true));

        tokio::time::sleep(Duration::from_millis(25)).await;
        tracker.set_typing("alice", true).await;
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), true));

        // The first timer was aborted; only one expiry arrives.
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), false));
        assert!(
            tokio::time::timeout(Duration::from_millis(80), next_typing(&mut rx))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_explicit_stop_cancels_expiry() {
        let (tracker, mut rx) = tracker(Duration::from_millis(30));

        tracker.set_typing("alice", true).await;
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), true));

        tracker.set_typing("alice", false).await;
        assert_eq!(next_typing(&mut rx).await, ("alice".into(), false));

        assert!(
            tokio::time::timeout(Duration::from_millis(60), next_typing(&mut rx))
                .await
                .is_err()
        );
    }
}
