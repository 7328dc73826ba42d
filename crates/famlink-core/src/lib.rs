//! # famlink Core Library
//!
//! The peer-to-peer core of the famlink family messenger: direct encrypted
//! channels between a small, fixed group of family members, with no central
//! message broker.
//!
//! ## Trust Model
//!
//! Membership is proven with a shared family PIN. A freshly opened channel
//! is worthless until the remote end demonstrates knowledge of that PIN via
//! a nonce-salted challenge-response exchange; the PIN itself never crosses
//! the wire.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! ├────────────────────┬────────────────────┤
//! │   peer (manager)   │   queue (delivery) │
//! ├────────────────────┴────────────────────┤
//! │            protocol (wire)              │
//! ├─────────────────────────────────────────┤
//! │        auth        │      crypto        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The transport itself (NAT traversal, datagram delivery) is supplied by
//! the embedding application through the [`peer::Transport`] trait; this
//! crate only assumes an ordered, reliable message channel.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod auth;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod queue;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum family size, including this member.
pub const MAX_FAMILY_SIZE: usize = 4;

/// Maximum serialized message size in bytes (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 65536;
