//! Challenge-response verification of the shared family PIN.
//!
//! Proves that both ends of a freshly opened channel hold the same PIN
//! without transmitting it. The initiating side sends a random nonce; the
//! accepting side answers with `SHA256(nonce || pin)`; the initiator
//! recomputes and compares in constant time. The nonce is single-use, so
//! an intercepted hash is worthless for replay against a new challenge.
//!
//! A handshake that produces no expected message within
//! [`HANDSHAKE_TIMEOUT`] of sending is failed outright; there is no
//! partial credit and no automatic retry.

use crate::crypto::{constant_time_eq, random_bytes, sha256};
use crate::protocol::{hex_id, now_millis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Hard deadline for either side of the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The same deadline applied to payload timestamps, in milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: i64 = 30_000;

/// Size of the challenge nonce in bytes.
pub const NONCE_SIZE: usize = 16;

/// The shared family PIN.
///
/// Held zeroized-on-drop and never logged or serialized.
pub struct Pin(Zeroizing<String>);

impl Pin {
    /// Wrap a PIN entered by the user.
    pub fn new(pin: impl Into<String>) -> Self {
        Self(Zeroizing::new(pin.into()))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin([REDACTED])")
    }
}

/// Identifier tying a response back to its challenge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId(#[serde(with = "hex_id")] pub [u8; 16]);

impl ChallengeId {
    /// Generate a random challenge id.
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

impl fmt::Debug for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// An outstanding challenge, owned by the initiating side.
///
/// Discarded once the response is verified, fails, or the timeout fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    /// Challenge identifier.
    pub challenge_id: ChallengeId,
    /// Single-use random nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl AuthChallenge {
    /// Generate a fresh challenge.
    pub fn generate() -> Self {
        Self {
            challenge_id: ChallengeId::random(),
            nonce: random_bytes(),
            timestamp: now_millis(),
        }
    }
}

/// The accepting side's answer to a challenge. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Identifier of the challenge being answered.
    pub challenge_id: ChallengeId,
    /// Hex-encoded `SHA256(nonce || pin)`.
    pub pin_hash: String,
    /// Response time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

fn pin_hash(nonce: &[u8; NONCE_SIZE], pin: &Pin) -> String {
    let mut combined = Vec::with_capacity(NONCE_SIZE + pin.as_bytes().len());
    combined.extend_from_slice(nonce);
    combined.extend_from_slice(pin.as_bytes());
    hex::encode(sha256(&combined))
}

/// Answer a received challenge with the local PIN.
pub fn respond(challenge: &AuthChallenge, pin: &Pin) -> AuthResponse {
    AuthResponse {
        challenge_id: challenge.challenge_id,
        pin_hash: pin_hash(&challenge.nonce, pin),
        timestamp: now_millis(),
    }
}

/// Verify a response against the outstanding challenge and the local PIN.
///
/// Accepts iff the challenge ids match, the hashes match byte-for-byte,
/// and the response timestamp lies within [`HANDSHAKE_TIMEOUT_MS`] of the
/// challenge's.
pub fn verify(challenge: &AuthChallenge, response: &AuthResponse, pin: &Pin) -> bool {
    if response.challenge_id != challenge.challenge_id {
        return false;
    }

    let expected = pin_hash(&challenge.nonce, pin);
    let hash_ok = constant_time_eq(expected.as_bytes(), response.pin_hash.as_bytes());
    let time_ok =
        (response.timestamp.saturating_sub(challenge.timestamp)).abs() < HANDSHAKE_TIMEOUT_MS;

    hash_ok && time_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_pin_verifies() {
        let pin = Pin::new("123456");
        let challenge = AuthChallenge::generate();
        let response = respond(&challenge, &pin);

        assert!(verify(&challenge, &response, &pin));
    }

    #[test]
    fn test_wrong_pin_rejected() {
        let challenge = AuthChallenge::generate();
        let response = respond(&challenge, &Pin::new("000000"));

        assert!(!verify(&challenge, &response, &Pin::new("123456")));
    }

    #[test]
    fn test_mismatched_challenge_id_rejected() {
        let pin = Pin::new("123456");
        let challenge = AuthChallenge::generate();
        let mut response = respond(&challenge, &pin);
        response.challenge_id = ChallengeId::random();

        assert!(!verify(&challenge, &response, &pin));
    }

    #[test]
    fn test_nonce_binds_response() {
        // A hash captured for one nonce must not satisfy another challenge.
        let pin = Pin::new("123456");
        let first = AuthChallenge::generate();
        let second = AuthChallenge::generate();

        let mut replayed = respond(&first, &pin);
        replayed.challenge_id = second.challenge_id;

        assert!(!verify(&second, &replayed, &pin));
    }

    #[test]
    fn test_timestamp_window() {
        let pin = Pin::new("123456");
        let challenge = AuthChallenge::generate();
        let mut response = respond(&challenge, &pin);

        // Just inside the window.
        response.timestamp = challenge.timestamp + HANDSHAKE_TIMEOUT_MS - 1;
        assert!(verify(&challenge, &response, &pin));

        // Exactly at the window.
        response.timestamp = challenge.timestamp + HANDSHAKE_TIMEOUT_MS;
        assert!(!verify(&challenge, &response, &pin));

        // Far in the past also fails; the window is two-sided.
        response.timestamp = challenge.timestamp - HANDSHAKE_TIMEOUT_MS;
        assert!(!verify(&challenge, &response, &pin));
    }

    #[test]
    fn test_response_hash_is_hex_sha256() {
        let response = respond(&AuthChallenge::generate(), &Pin::new("123456"));
        assert_eq!(response.pin_hash.len(), 64);
        assert!(response.pin_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_pin_never_in_wire_payload() {
        let pin = Pin::new("123456");
        let challenge = AuthChallenge::generate();
        let response = respond(&challenge, &pin);

        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("123456"));
    }

    #[test]
    fn test_pin_debug_redacts() {
        assert_eq!(format!("{:?}", Pin::new("123456")), "Pin([REDACTED])");
    }
}
