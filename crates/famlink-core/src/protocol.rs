//! Wire protocol for channel frames.
//!
//! Every frame crossing a channel is a [`DataMessage`]: a JSON object with
//! a `type` discriminator and a `data` payload. Application traffic
//! (`text`, `encrypted`, `typing`, `presence`) and handshake traffic
//! (`auth-challenge`, `auth-response`) share the same envelope; the peer
//! manager intercepts handshake frames before application dispatch.

use crate::auth::{AuthChallenge, AuthResponse};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serde helper for 16-byte identifiers carried as hex strings.
pub(crate) mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 16], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid id length"))
    }
}

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unique identifier for a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "hex_id")] pub [u8; 16]);

impl MessageId {
    /// Generate a random message id.
    pub fn random() -> Self {
        Self(crate::crypto::random_bytes())
    }

    /// Get as bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A frame carried over a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sender's peer id.
    pub sender_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Typed payload, carried on the wire as `type` + `data`.
    #[serde(flatten)]
    pub body: MessageBody,
}

/// The enumerated message kinds and their payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum MessageBody {
    /// Plain text message.
    Text(String),
    /// Message encrypted with the family key.
    Encrypted(EncryptedPayload),
    /// Typing indicator.
    Typing(TypingPayload),
    /// Peer metadata announcement.
    Presence(PresencePayload),
    /// Handshake: challenge from the initiating side.
    AuthChallenge(AuthChallenge),
    /// Handshake: response from the accepting side.
    AuthResponse(AuthResponse),
}

/// Payload of an `encrypted` frame: nonce-prefixed AEAD output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// `nonce || ciphertext || tag`, as produced by
    /// [`crate::crypto::encrypt_message`].
    pub ciphertext: Vec<u8>,
}

/// Payload of a `typing` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Whether the sender is currently typing.
    pub is_typing: bool,
}

/// Payload of a `presence` frame.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresencePayload {
    /// Display name, if the sender chose to share one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DataMessage {
    fn new(sender_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: MessageId::random(),
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            body,
        }
    }

    /// Create a plain text message.
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_id, MessageBody::Text(text.into()))
    }

    /// Create an encrypted message from already-encrypted bytes.
    pub fn encrypted(sender_id: impl Into<String>, ciphertext: Vec<u8>) -> Self {
        Self::new(sender_id, MessageBody::Encrypted(EncryptedPayload { ciphertext }))
    }

    /// Create a typing indicator.
    pub fn typing(sender_id: impl Into<String>, is_typing: bool) -> Self {
        Self::new(sender_id, MessageBody::Typing(TypingPayload { is_typing }))
    }

    /// Create a presence announcement.
    pub fn presence(sender_id: impl Into<String>, name: Option<String>) -> Self {
        Self::new(sender_id, MessageBody::Presence(PresencePayload { name }))
    }

    /// Create a handshake challenge frame.
    pub(crate) fn auth_challenge(
        sender_id: impl Into<String>,
        challenge: AuthChallenge,
    ) -> Self {
        Self::new(sender_id, MessageBody::AuthChallenge(challenge))
    }

    /// Create a handshake response frame.
    pub(crate) fn auth_response(sender_id: impl Into<String>, response: AuthResponse) -> Self {
        Self::new(sender_id, MessageBody::AuthResponse(response))
    }

    /// The wire discriminator for this message.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Text(_) => "text",
            MessageBody::Encrypted(_) => "encrypted",
            MessageBody::Typing(_) => "typing",
            MessageBody::Presence(_) => "presence",
            MessageBody::AuthChallenge(_) => "auth-challenge",
            MessageBody::AuthResponse(_) => "auth-response",
        }
    }

    /// Whether this frame belongs to the handshake, not the application.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.body,
            MessageBody::AuthChallenge(_) | MessageBody::AuthResponse(_)
        )
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        if json.len() > crate::MAX_MESSAGE_SIZE {
            return Err(Error::Encoding("message exceeds size limit".into()));
        }
        Ok(json)
    }

    /// Parse from the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        if json.len() > crate::MAX_MESSAGE_SIZE {
            return Err(Error::Encoding("message exceeds size limit".into()));
        }
        Ok(serde_json::from_str(json)?)
    }
}
