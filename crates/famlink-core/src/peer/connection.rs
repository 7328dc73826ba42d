//! Per-peer connection records.

use super::transport::Channel;
use crate::protocol::now_millis;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Verification state of a peer connection.
///
/// A channel reporting "open" is not enough: nothing is routed to or from
/// a peer until the challenge-response handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// Channel is open but the handshake has not completed.
    Unverified,
    /// Handshake completed; the peer may send and receive.
    Verified,
}

/// Public view of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's id.
    pub peer_id: String,
    /// Display name announced via presence, if any.
    pub name: Option<String>,
    /// Milliseconds since the Unix epoch of the last inbound frame.
    pub last_seen: i64,
}

/// One remote participant: the exclusively-owned channel plus its
/// lifecycle state. At most one exists per peer id.
pub(crate) struct PeerConnection {
    peer_id: String,
    channel: Arc<dyn Channel>,
    state: VerifyState,
    name: Option<String>,
    last_seen: i64,
    /// Reader task draining the channel's events; aborted on teardown.
    reader: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Create a record for a freshly opened, not-yet-verified channel.
    pub(crate) fn new(peer_id: impl Into<String>, channel: Arc<dyn Channel>) -> Self {
        Self {
            peer_id: peer_id.into(),
            channel,
            state: VerifyState::Unverified,
            name: None,
            last_seen: now_millis(),
            reader: None,
        }
    }

    pub(crate) fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub(crate) fn is_verified(&self) -> bool {
        self.state == VerifyState::Verified
    }

    pub(crate) fn mark_verified(&mut self) {
        self.state = VerifyState::Verified;
        self.last_seen = now_millis();
    }

    pub(crate) fn set_reader(&mut self, handle: JoinHandle<()>) {
        self.reader = Some(handle);
    }

    /// Detach the reader handle without aborting it. Used when teardown
    /// runs inside the reader task itself.
    pub(crate) fn take_reader(&mut self) -> Option<JoinHandle<()>> {
        self.reader.take()
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        if name.is_some() {
            self.name = name;
        }
    }

    /// Record inbound activity.
    pub(crate) fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            last_seen: self.last_seen,
        }
    }

    /// Tear down: stop the reader task and close the channel.
    pub(crate) fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.channel.close();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}
