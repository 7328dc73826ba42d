//! Error types for famlink.
//!
//! Error messages are intentionally generic: they never echo PINs,
//! nonces, or challenge hashes.

use thiserror::Error;

/// Core error type for famlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure: channel failed to open or dropped
    /// mid-session. Recovered via the reconnect backoff schedule.
    #[error("transport error")]
    Transport(String),

    /// Challenge-response handshake failed.
    /// Never retried automatically; a fresh connection attempt starts a
    /// fresh handshake.
    #[error("handshake failed")]
    Handshake(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Attempted to connect to our own peer id.
    #[error("cannot connect to self")]
    SelfConnection,

    /// The family already has its maximum number of members.
    #[error("family is full")]
    FamilyFull,

    /// The underlying channel is closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Cryptographic operation failed.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),
}

/// Result type alias for famlink operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}
