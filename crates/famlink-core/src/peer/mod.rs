//! Peer connection management.
//!
//! The [`PeerManager`] owns every channel to a family member: it opens
//! outbound channels, accepts inbound ones, runs the challenge-response
//! handshake on both roles, and routes verified traffic to subscribers.
//! The transport itself lives behind the [`Transport`] trait.

mod connection;
mod manager;
mod transport;
mod typing;

pub use connection::{PeerInfo, VerifyState};
pub use manager::{PeerEvent, PeerManager, PeerManagerConfig};
pub use transport::{
    Channel, ChannelEvent, ChannelHandle, Transport, CHANNEL_EVENT_BUFFER,
};
pub use typing::TYPING_TIMEOUT;
