//! Shared-key message encryption using ChaCha20-Poly1305.
//!
//! Every family member holds the same [`FamilyKey`]; encrypted message
//! payloads carry a fresh random nonce prepended to the ciphertext so the
//! receiver needs nothing beyond the key itself.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroizing;

/// Size of the family key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// The family's shared symmetric key.
///
/// Zeroized on drop. Distributed out-of-band (QR code, invite link); this
/// crate never transmits it.
pub struct FamilyKey(Zeroizing<[u8; KEY_SIZE]>);

impl FamilyKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(Zeroizing::new(super::random_bytes()))
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Hex-encoded SHA-256 fingerprint for out-of-band verification.
    pub fn fingerprint(&self) -> String {
        super::fingerprint(&*self.0)
    }

    fn as_key(&self) -> &Key {
        Key::from_slice(&*self.0)
    }
}

impl std::fmt::Debug for FamilyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FamilyKey([REDACTED])")
    }
}

/// Encrypt a message payload with the family key.
///
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt_message(key: &FamilyKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_key());
    let nonce_bytes: [u8; NONCE_SIZE] = super::random_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` payload with the family key.
pub fn decrypt_message(key: &FamilyKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }

    let cipher = ChaCha20Poly1305::new(key.as_key());
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| Error::Crypto("decryption failed".into()))
}
