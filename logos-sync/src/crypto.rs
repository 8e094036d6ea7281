//! Room-key symmetric encryption.
//!
//! Every payload that leaves the process (updates, snapshots, awareness,
//! room info) is sealed with XChaCha20-Poly1305 under the room key. The
//! ciphertext layout is:
//!
//! ```text
//! ┌──────────┬───────────────────────────┐
//! │ nonce    │ ciphertext ‖ tag          │
//! │ 24 bytes │ len(plaintext) + 16 bytes │
//! └──────────┴───────────────────────────┘
//! ```
//!
//! The room key also deterministically yields the ed25519 keypair used as
//! the session identity, so every holder of the key presents the same
//! identity to the relay without the key itself ever being transmitted.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const IDENTITY_SALT: &[u8] = b"logos-sync/room-key";
const IDENTITY_INFO: &[u8] = b"session-identity/ed25519/v1";

/// Per-room symmetric secret.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    /// Generate a fresh random room key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded key (as shared out of band in invite links).
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(text).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::KeyDerivation("room key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the reproducible session signing key for this room.
    pub fn signing_key(&self) -> Result<SigningKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(IDENTITY_SALT), &self.0);
        let mut seed = [0u8; 32];
        hk.expand(IDENTITY_INFO, &mut seed)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Seal `plaintext` under the room key.
pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a payload produced by [`encrypt`].
pub fn decrypt(key: &RoomKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated(ciphertext.len()));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::Decrypt)
}
