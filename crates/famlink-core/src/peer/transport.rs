//! Transport seam.
//!
//! The embedding application supplies NAT traversal and datagram delivery
//! (WebRTC data channels, a relay, an in-memory pair in tests) behind
//! these traits. The core assumes nothing beyond an ordered, reliable,
//! bidirectional message channel with open/data/close/error signaling.

use crate::error::Result;
use crate::protocol::DataMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default capacity of a channel's event buffer.
pub const CHANNEL_EVENT_BUFFER: usize = 64;

/// Events surfaced by an open channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A frame arrived from the remote side.
    Data(DataMessage),
    /// The remote side closed the channel cleanly.
    Closed,
    /// The channel failed.
    Error(String),
}

/// One half of an open bidirectional channel.
///
/// `send` hands a frame to the transport; actual delivery is asynchronous
/// and follows the transport's ordering guarantees.
pub trait Channel: Send + Sync {
    /// The remote peer's id.
    fn peer_id(&self) -> &str;

    /// Send a frame to the remote side.
    fn send(&self, message: &DataMessage) -> Result<()>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// An open channel paired with its inbound event stream.
pub struct ChannelHandle {
    /// The sending half.
    pub channel: Arc<dyn Channel>,
    /// Events arriving from the remote side.
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelHandle {
    /// Bundle a channel with its event stream.
    pub fn new(channel: Arc<dyn Channel>, events: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { channel, events }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("peer_id", &self.channel.peer_id())
            .finish()
    }
}

/// Opens outbound channels toward remote peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `peer_id`, resolving once the channel reports
    /// open (or failing with a transport error).
    async fn connect(&self, peer_id: &str) -> Result<ChannelHandle>;
}
