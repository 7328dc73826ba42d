//! Cryptographic primitives for famlink.
//!
//! Only audited primitives are used:
//!
//! - **SHA-256**: challenge-response hashing, key fingerprints
//! - **ChaCha20-Poly1305**: authenticated message encryption (AEAD)
//! - **OS randomness**: nonces, identifiers, keys
//!
//! The message cipher here is a shared-key placeholder, not a ratcheting
//! protocol: every family member holds the same 32-byte key and there is
//! no forward secrecy. It exists so message payloads are opaque on the
//! wire, nothing more.

mod cipher;

pub use cipher::{
    decrypt_message, encrypt_message, FamilyKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};

use sha2::{Digest, Sha256};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// SHA-256 digest of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex-encoded SHA-256 fingerprint, used to let family members verify a
/// key out-of-band without revealing the key itself.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Constant-time comparison of byte slices.
///
/// Prevents timing attacks when comparing secrets.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
