//! Peer connection lifecycle manager.
//!
//! Owns the set of channels to family members, drives the
//! challenge-response handshake on both roles, classifies verified inbound
//! traffic, and reconnects errored peers with exponential backoff.
//!
//! A channel only enters the connected set after the handshake completes;
//! until then nothing is routed in either direction. Transport errors are
//! retried on a per-peer backoff schedule; authentication failures are
//! fatal for that attempt and require a fresh, explicit `connect`.

use super::connection::{PeerConnection, PeerInfo};
use super::transport::{ChannelEvent, ChannelHandle, Transport};
use super::typing::{TypingTracker, TYPING_TIMEOUT};
use crate::auth::{self, AuthChallenge, AuthResponse, Pin, HANDSHAKE_TIMEOUT};
use crate::error::{Error, Result};
use crate::logging::{RedactedBytes, RedactedHex};
use crate::protocol::{DataMessage, MessageBody};
use crate::queue::Broadcaster;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the manager's event broadcast channel.
const EVENT_BUFFER: usize = 100;

/// Configuration for a [`PeerManager`].
#[derive(Debug)]
pub struct PeerManagerConfig {
    /// Our own peer id.
    pub peer_id: String,
    /// The shared family PIN used to verify peers.
    pub pin: Pin,
    /// Display name announced to verified peers, if any.
    pub display_name: Option<String>,
    /// Reconnect attempts before a peer is declared unreachable.
    pub max_reconnect_attempts: u32,
    /// Reconnect delay unit; attempt `n` waits `base * 2^n`.
    pub reconnect_base: Duration,
    /// Deadline for either side of the handshake.
    pub handshake_timeout: Duration,
    /// Family size cap, including this member.
    pub max_family_size: usize,
}

impl PeerManagerConfig {
    /// Create a configuration with default policy values.
    pub fn new(peer_id: impl Into<String>, pin: Pin) -> Self {
        Self {
            peer_id: peer_id.into(),
            pin,
            display_name: None,
            max_reconnect_attempts: 5,
            reconnect_base: Duration::from_secs(1),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_family_size: crate::MAX_FAMILY_SIZE,
        }
    }
}

/// Events emitted by the manager.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer completed the handshake and joined the connected set.
    PeerConnected {
        /// The peer's id.
        peer_id: String,
    },
    /// A peer left the connected set.
    PeerDisconnected {
        /// The peer's id.
        peer_id: String,
    },
    /// An application message arrived from a verified peer.
    MessageReceived {
        /// The received message.
        message: DataMessage,
    },
    /// A peer's typing state changed.
    TypingChanged {
        /// The peer's id.
        peer_id: String,
        /// Whether the peer is typing.
        is_typing: bool,
    },
    /// A peer's metadata (name, last seen) was updated.
    PeerUpdated {
        /// The peer's id.
        peer_id: String,
    },
    /// A connection attempt failed terminally: authentication was
    /// rejected, or the reconnect budget ran out.
    ConnectionFailed {
        /// The peer's id.
        peer_id: String,
        /// Failure description.
        error: String,
    },
}

#[derive(Default)]
struct ReconnectState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    config: PeerManagerConfig,
    transport: Arc<dyn Transport>,
    peers: RwLock<HashMap<String, PeerConnection>>,
    reconnects: Mutex<HashMap<String, ReconnectState>>,
    typing: TypingTracker,
    event_tx: broadcast::Sender<PeerEvent>,
}

/// Manages the family's peer connections.
///
/// Cheap to clone; all clones share the same connection set.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    /// Create a manager over the given transport.
    pub fn new(
        config: PeerManagerConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, broadcast::Receiver<PeerEvent>) {
        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);
        let typing = TypingTracker::new(event_tx.clone(), TYPING_TIMEOUT);

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                peers: RwLock::new(HashMap::new()),
                reconnects: Mutex::new(HashMap::new()),
                typing,
                event_tx,
            }),
        };

        (manager, event_rx)
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Our own peer id.
    pub fn local_peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    /// Open, authenticate, and register a connection to `peer_id`.
    ///
    /// Resolves with success immediately if the peer is already connected.
    /// Transport failures schedule a backoff reconnect before returning
    /// the error; authentication failures do not.
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        Self::connect_inner(self.inner.clone(), peer_id.to_string()).await
    }

    /// Authenticate and register a channel opened by a remote peer.
    pub async fn accept_incoming(&self, handle: ChannelHandle) -> Result<()> {
        let inner = &self.inner;
        let ChannelHandle { channel, mut events } = handle;
        let peer_id = channel.peer_id().to_string();

        if peer_id == inner.config.peer_id {
            channel.close();
            return Err(Error::SelfConnection);
        }
        if inner.peers.read().await.contains_key(&peer_id) {
            debug!(peer = %peer_id, "already connected, dropping duplicate channel");
            channel.close();
            return Ok(());
        }
        if let Err(e) = Self::check_capacity(inner).await {
            channel.close();
            return Err(e);
        }

        let mut conn = PeerConnection::new(&peer_id, channel);
        match Self::accept_handshake(inner, &conn, &mut events).await {
            Ok(()) => {
                conn.mark_verified();
                Self::register(inner, conn, events).await;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "incoming handshake failed");
                conn.close();
                if matches!(e, Error::Transport(_) | Error::ChannelClosed) {
                    Self::schedule_reconnect(inner, &peer_id).await;
                } else {
                    let _ = inner.event_tx.send(PeerEvent::ConnectionFailed {
                        peer_id: peer_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Deliver to exactly one verified peer.
    ///
    /// Returns false, never an error, when no open verified channel
    /// exists for `peer_id`.
    pub async fn send(&self, peer_id: &str, message: &DataMessage) -> bool {
        let peers = self.inner.peers.read().await;
        match peers.get(peer_id) {
            Some(conn) if conn.is_verified() => match conn.channel().send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "send failed");
                    false
                }
            },
            _ => {
                debug!(peer = %peer_id, "no verified channel");
                false
            }
        }
    }

    /// Deliver to every currently verified peer; unverified peers are
    /// silently skipped. Returns how many peers the message reached.
    pub async fn broadcast(&self, message: &DataMessage) -> Result<usize> {
        let channels: Vec<_> = {
            let peers = self.inner.peers.read().await;
            peers
                .values()
                .filter(|c| c.is_verified())
                .map(|c| (c.peer_id().to_string(), c.channel().clone()))
                .collect()
        };

        if channels.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        for (peer_id, channel) in &channels {
            match channel.send(message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %peer_id, error = %e, "broadcast send failed"),
            }
        }

        if delivered == 0 {
            return Err(Error::Transport("broadcast reached no peers".into()));
        }
        Ok(delivered)
    }

    /// Broadcast our typing state.
    pub async fn broadcast_typing(&self, is_typing: bool) -> Result<usize> {
        self.broadcast(&DataMessage::typing(
            self.inner.config.peer_id.clone(),
            is_typing,
        ))
        .await
    }

    /// Announce our display name to verified peers.
    pub async fn announce_presence(&self) -> Result<usize> {
        self.broadcast(&DataMessage::presence(
            self.inner.config.peer_id.clone(),
            self.inner.config.display_name.clone(),
        ))
        .await
    }

    /// Close the channel to `peer_id` and remove it from the connected
    /// set. Cancels any pending reconnect.
    pub async fn disconnect(&self, peer_id: &str) {
        if let Some(mut conn) = self.inner.peers.write().await.remove(peer_id) {
            conn.close();
            info!(peer = %peer_id, "disconnected");
            let _ = self.inner.event_tx.send(PeerEvent::PeerDisconnected {
                peer_id: peer_id.to_string(),
            });
        }
        if let Some(state) = self.inner.reconnects.lock().await.remove(peer_id) {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }
        self.inner.typing.clear(peer_id).await;
    }

    /// Disconnect every peer.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.inner.peers.read().await.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Disconnect everything and cancel all timers.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        {
            let mut reconnects = self.inner.reconnects.lock().await;
            for (_, state) in reconnects.drain() {
                if let Some(timer) = state.timer {
                    timer.abort();
                }
            }
        }
        self.inner.typing.shutdown().await;
    }

    /// The currently verified peers.
    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .await
            .values()
            .filter(|c| c.is_verified())
            .map(|c| c.info())
            .collect()
    }

    /// Whether `peer_id` has an open, verified channel.
    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.inner
            .peers
            .read()
            .await
            .get(peer_id)
            .map(|c| c.is_verified())
            .unwrap_or(false)
    }

    /// Number of currently verified peers.
    pub async fn verified_peer_count(&self) -> usize {
        self.inner
            .peers
            .read()
            .await
            .values()
            .filter(|c| c.is_verified())
            .count()
    }

    fn connect_inner(
        inner: Arc<Inner>,
        peer_id: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
        Box::pin(Self::connect_inner_impl(inner, peer_id))
    }

    async fn connect_inner_impl(inner: Arc<Inner>, peer_id: String) -> Result<()> {
        if peer_id == inner.config.peer_id {
            return Err(Error::SelfConnection);
        }
        if inner.peers.read().await.contains_key(&peer_id) {
            debug!(peer = %peer_id, "already connected");
            return Ok(());
        }
        Self::check_capacity(&inner).await?;

        info!(peer = %peer_id, "connecting");
        let handle = match inner.transport.connect(&peer_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "channel failed to open");
                Self::schedule_reconnect(&inner, &peer_id).await;
                return Err(e);
            }
        };

        let ChannelHandle { channel, mut events } = handle;
        let mut conn = PeerConnection::new(&peer_id, channel);
        match Self::initiate_handshake(&inner, &conn, &mut events).await {
            Ok(()) => {
                conn.mark_verified();
                Self::register(&inner, conn, events).await;
                Ok(())
            }
            Err(e) => {
                conn.close();
                if matches!(e, Error::Transport(_) | Error::ChannelClosed) {
                    Self::schedule_reconnect(&inner, &peer_id).await;
                } else {
                    warn!(peer = %peer_id, error = %e, "handshake failed");
                    let _ = inner.event_tx.send(PeerEvent::ConnectionFailed {
                        peer_id: peer_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Initiator role: challenge the remote side and verify its response.
    async fn initiate_handshake(
        inner: &Arc<Inner>,
        conn: &PeerConnection,
        events: &mut mpsc::Receiver<ChannelEvent>,
    ) -> Result<()> {
        let challenge = AuthChallenge::generate();
        debug!(
            peer = %conn.peer_id(),
            challenge = %challenge.challenge_id,
            nonce = %RedactedBytes(&challenge.nonce),
            "sending challenge"
        );
        conn.channel().send(&DataMessage::auth_challenge(
            inner.config.peer_id.clone(),
            challenge.clone(),
        ))?;

        let response = Self::await_response(inner, events).await?;
        if auth::verify(&challenge, &response, &inner.config.pin) {
            debug!(peer = %conn.peer_id(), "challenge verified");
            Ok(())
        } else {
            warn!(
                peer = %conn.peer_id(),
                hash = %RedactedHex(&response.pin_hash),
                "challenge verification failed"
            );
            Err(Error::Handshake("challenge verification failed".into()))
        }
    }

    /// Acceptor role: answer the remote side's challenge with our PIN.
    ///
    /// The acceptor's verification step completes once it has answered; a
    /// PIN mismatch surfaces as the initiator tearing the channel down.
    async fn accept_handshake(
        inner: &Arc<Inner>,
        conn: &PeerConnection,
        events: &mut mpsc::Receiver<ChannelEvent>,
    ) -> Result<()> {
        let challenge = Self::await_challenge(inner, events).await?;
        debug!(peer = %conn.peer_id(), challenge = %challenge.challenge_id, "answering challenge");

        let response = auth::respond(&challenge, &inner.config.pin);
        conn.channel()
            .send(&DataMessage::auth_response(inner.config.peer_id.clone(), response))?;
        Ok(())
    }

    async fn await_response(
        inner: &Arc<Inner>,
        events: &mut mpsc::Receiver<ChannelEvent>,
    ) -> Result<AuthResponse> {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Data(msg)) => match msg.body {
                        MessageBody::AuthResponse(response) => return Ok(response),
                        _ => debug!(kind = msg.kind(), "ignoring frame before verification"),
                    },
                    Some(ChannelEvent::Closed) | None => return Err(Error::ChannelClosed),
                    Some(ChannelEvent::Error(e)) => return Err(Error::Transport(e)),
                }
            }
        };
        tokio::time::timeout(inner.config.handshake_timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn await_challenge(
        inner: &Arc<Inner>,
        events: &mut mpsc::Receiver<ChannelEvent>,
    ) -> Result<AuthChallenge> {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Data(msg)) => match msg.body {
                        MessageBody::AuthChallenge(challenge) => return Ok(challenge),
                        _ => debug!(kind = msg.kind(), "ignoring frame before verification"),
                    },
                    Some(ChannelEvent::Closed) | None => return Err(Error::ChannelClosed),
                    Some(ChannelEvent::Error(e)) => return Err(Error::Transport(e)),
                }
            }
        };
        tokio::time::timeout(inner.config.handshake_timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Insert a verified connection, start its reader, and announce it.
    async fn register(
        inner: &Arc<Inner>,
        mut conn: PeerConnection,
        events: mpsc::Receiver<ChannelEvent>,
    ) {
        let peer_id = conn.peer_id().to_string();

        // A successful connect resets the backoff schedule.
        if let Some(state) = inner.reconnects.lock().await.remove(&peer_id) {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }

        let reader = tokio::spawn(Self::read_loop(inner.clone(), peer_id.clone(), events));
        conn.set_reader(reader);

        if let Some(mut previous) = inner.peers.write().await.insert(peer_id.clone(), conn) {
            previous.close();
        }

        info!(peer = %peer_id, "peer connected");
        let _ = inner
            .event_tx
            .send(PeerEvent::PeerConnected { peer_id });
    }

    async fn read_loop(
        inner: Arc<Inner>,
        peer_id: String,
        mut events: mpsc::Receiver<ChannelEvent>,
    ) {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Data(msg)) => Self::dispatch(&inner, &peer_id, msg).await,
                Some(ChannelEvent::Closed) | None => {
                    debug!(peer = %peer_id, "channel closed");
                    Self::teardown(&inner, &peer_id, false).await;
                    break;
                }
                Some(ChannelEvent::Error(e)) => {
                    warn!(peer = %peer_id, error = %e, "channel error");
                    Self::teardown(&inner, &peer_id, true).await;
                    break;
                }
            }
        }
    }

    /// Route one verified inbound frame by its wire tag.
    async fn dispatch(inner: &Arc<Inner>, peer_id: &str, msg: DataMessage) {
        match &msg.body {
            MessageBody::AuthChallenge(_) | MessageBody::AuthResponse(_) => {
                debug!(peer = %peer_id, kind = msg.kind(), "discarding handshake frame on verified channel");
            }
            MessageBody::Typing(typing) => {
                Self::touch(inner, peer_id).await;
                inner.typing.set_typing(peer_id, typing.is_typing).await;
            }
            MessageBody::Presence(presence) => {
                {
                    let mut peers = inner.peers.write().await;
                    if let Some(conn) = peers.get_mut(peer_id) {
                        conn.touch();
                        conn.set_name(presence.name.clone());
                    }
                }
                let _ = inner.event_tx.send(PeerEvent::PeerUpdated {
                    peer_id: peer_id.to_string(),
                });
            }
            MessageBody::Text(_) | MessageBody::Encrypted(_) => {
                Self::touch(inner, peer_id).await;
                let _ = inner
                    .event_tx
                    .send(PeerEvent::MessageReceived { message: msg });
            }
        }
    }

    async fn touch(inner: &Arc<Inner>, peer_id: &str) {
        if let Some(conn) = inner.peers.write().await.get_mut(peer_id) {
            conn.touch();
        }
    }

    /// Remove a dead connection. Runs inside the reader task, so the
    /// reader handle is dropped without an abort.
    async fn teardown(inner: &Arc<Inner>, peer_id: &str, reconnect: bool) {
        if let Some(mut conn) = inner.peers.write().await.remove(peer_id) {
            conn.take_reader();
            conn.close();
        }
        inner.typing.clear(peer_id).await;
        let _ = inner.event_tx.send(PeerEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
        if reconnect {
            Self::schedule_reconnect(inner, peer_id).await;
        }
    }

    /// Count a failure for `peer_id` and either schedule the next attempt
    /// (`base * 2^attempts`) or declare the peer unreachable.
    async fn schedule_reconnect(inner: &Arc<Inner>, peer_id: &str) {
        let mut reconnects = inner.reconnects.lock().await;
        let state = reconnects.entry(peer_id.to_string()).or_default();
        state.attempts += 1;

        if state.attempts >= inner.config.max_reconnect_attempts {
            warn!(peer = %peer_id, attempts = state.attempts, "reconnect budget exhausted");
            reconnects.remove(peer_id);
            let _ = inner.event_tx.send(PeerEvent::ConnectionFailed {
                peer_id: peer_id.to_string(),
                error: "max reconnect attempts exceeded".into(),
            });
            return;
        }

        let delay = inner
            .config
            .reconnect_base
            .saturating_mul(2u32.saturating_pow(state.attempts.min(16)));
        info!(
            peer = %peer_id,
            attempt = state.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        if let Some(old) = state.timer.take() {
            old.abort();
        }
        let inner = inner.clone();
        let peer_id = peer_id.to_string();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = Self::connect_inner(inner, peer_id.clone()).await {
                debug!(peer = %peer_id, error = %e, "reconnect attempt failed");
            }
        }));
    }

    async fn check_capacity(inner: &Arc<Inner>) -> Result<()> {
        if inner.peers.read().await.len() + 1 >= inner.config.max_family_size {
            return Err(Error::FamilyFull);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peer_id", &self.inner.config.peer_id)
            .finish()
    }
}

#[async_trait]
impl Broadcaster for PeerManager {
    async fn verified_peer_count(&self) -> usize {
        PeerManager::verified_peer_count(self).await
    }

    async fn broadcast(&self, message: &DataMessage) -> Result<usize> {
        PeerManager::broadcast(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn connect(&self, _peer_id: &str) -> Result<ChannelHandle> {
            Err(Error::Transport("unavailable".into()))
        }
    }

    fn test_manager() -> (PeerManager, broadcast::Receiver<PeerEvent>) {
        let config = PeerManagerConfig::new("alice", Pin::new("123456"));
        PeerManager::new(config, Arc::new(NoTransport))
    }

    #[test]
    fn test_config_defaults() {
        let config = PeerManagerConfig::new("alice", Pin::new("123456"));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.handshake_timeout, HANDSHAKE_TIMEOUT);
        assert_eq!(config.max_family_size, crate::MAX_FAMILY_SIZE);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (manager, _rx) = test_manager();
        assert!(matches!(
            manager.connect("alice").await,
            Err(Error::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn test_send_without_channel_returns_false() {
        let (manager, _rx) = test_manager();
        let msg = DataMessage::text("alice", "hi");
        assert!(!manager.send("bob", &msg).await);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers_is_noop() {
        let (manager, _rx) = test_manager();
        let msg = DataMessage::text("alice", "hi");
        assert_eq!(manager.broadcast(&msg).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let (manager, _rx) = test_manager();
        assert!(matches!(
            manager.connect("bob").await,
            Err(Error::Transport(_))
        ));
        // Cancel the reconnect the failure scheduled.
        manager.shutdown().await;
    }
}
