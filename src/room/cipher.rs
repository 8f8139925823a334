// Shared room key and authenticated encryption of chat bodies

use crate::room::error::{ChatError, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use subtle::{Choice, ConstantTimeEq};

/// Length of the room key in bytes
pub const KEY_SIZE: usize = 32;

/// Length of the per-message nonce in bytes (XChaCha20 extended nonce)
pub const NONCE_SIZE: usize = 24;

/// Symmetric key shared by every peer of one room.
///
/// Serves both as the encryption key and as the handshake credential.
/// Peers exchange it out of band as 64 hex characters.
#[derive(Clone)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            ChatError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Parse the hex text form; surrounding whitespace and either case are accepted
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| ChatError::InvalidKey(format!("not a hex key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Lowercase hex text form, as presented in the handshake
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl FromStr for SharedSecret {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; KEY_SIZE]> for SharedSecret {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl ConstantTimeEq for SharedSecret {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0[..].ct_eq(&other.0[..])
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Encrypt `plaintext` under `key` with a freshly generated nonce.
///
/// Returns the nonce alongside the ciphertext; the ciphertext carries the
/// Poly1305 tag and is bound to that nonce.
pub fn encrypt(plaintext: &[u8], key: &SharedSecret) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ChatError::Authentication)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate a chat body.
///
/// Any tampering, a different key, or a nonce of the wrong size all surface
/// as [`ChatError::Authentication`].
pub fn decrypt(nonce: &[u8], ciphertext: &[u8], key: &SharedSecret) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(ChatError::Authentication);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| ChatError::Authentication)
}
