//! Channel key derivation and payload encryption
//!
//! Channel keys are derived from short ASCII secrets: the world id of the
//! recipient for direct messages, a fixed shared secret for everything
//! else. The secret is right-padded with `'0'` characters or truncated to
//! [`KEY_LENGTH`] bytes, which is how deployed clients derive it, so keys
//! must stay byte-for-byte compatible.
//!
//! Payloads are sealed with AES-128-GCM. The wire form is
//! `base64(nonce || ciphertext)`.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use rand::RngCore;

/// Symmetric key length in bytes
pub const KEY_LENGTH: usize = 16;

const NONCE_LENGTH: usize = 12;
const PAD_BYTE: u8 = b'0';

/// Secret a channel key is derived from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMaterial(String);

impl KeyMaterial {
    /// Fixed secret shared by every public topic
    pub fn shared(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Secret scoped to a partition (the recipient's world)
    pub fn partition(world: u16) -> Self {
        Self(world.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn derive(&self) -> ChannelKey {
        ChannelKey::derive(&self.0)
    }
}

/// A fixed-size symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey([u8; KEY_LENGTH]);

impl ChannelKey {
    /// Pad with `'0'` or truncate `secret` to exactly [`KEY_LENGTH`] bytes
    pub fn derive(secret: &str) -> Self {
        let mut key = [PAD_BYTE; KEY_LENGTH];
        let bytes = secret.as_bytes();
        let n = bytes.len().min(KEY_LENGTH);
        key[..n].copy_from_slice(&bytes[..n]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Base64 form, as channel cipher options usually expect it
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// Errors from sealing or opening a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Payload is not valid base64
    Encoding,
    /// Payload is shorter than a nonce
    Truncated,
    /// Authentication failed (wrong key or tampered payload)
    Authentication,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::Encoding => write!(f, "payload is not valid base64"),
            CipherError::Truncated => write!(f, "payload is truncated"),
            CipherError::Authentication => write!(f, "payload failed authentication"),
        }
    }
}

impl std::error::Error for CipherError {}

/// AES-128-GCM sealer bound to one channel key
#[derive(Clone)]
pub struct ChannelCipher {
    key: ChannelKey,
    aead: Aes128Gcm,
}

impl ChannelCipher {
    pub fn new(key: ChannelKey) -> Self {
        let aead = Aes128Gcm::new(key.as_bytes().into());
        Self { key, aead }
    }

    pub fn from_material(material: &KeyMaterial) -> Self {
        Self::new(material.derive())
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Seal a plaintext payload with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CipherError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Authentication)?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Bytes::from(BASE64.encode(sealed)))
    }

    /// Open a sealed payload
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let raw = BASE64.decode(sealed).map_err(|_| CipherError::Encoding)?;
        if raw.len() < NONCE_LENGTH {
            return Err(CipherError::Truncated);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LENGTH);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)
    }
}

impl fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_secret_is_padded_with_zero_chars() {
        let key = ChannelKey::derive("pub");
        assert_eq!(key.as_bytes(), b"pub0000000000000");

        let key = KeyMaterial::partition(301).derive();
        assert_eq!(key.as_bytes(), b"3010000000000000");
    }

    #[test]
    fn test_long_secret_is_truncated() {
        let key = ChannelKey::derive("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(key.as_bytes(), b"abcdefghijklmnop");
    }

    #[test]
    fn test_empty_secret() {
        assert_eq!(ChannelKey::derive("").as_bytes(), &[b'0'; KEY_LENGTH]);
    }

    #[test]
    fn test_base64_form() {
        assert_eq!(
            ChannelKey::derive("pub").to_base64(),
            "cHViMDAwMDAwMDAwMDAwMA=="
        );
    }

    #[test]
    fn test_sealed_payload_opens_with_same_key_only() {
        let cipher = ChannelCipher::from_material(&KeyMaterial::partition(301));
        let sealed = cipher.encrypt(br#"{"message":"hi"}"#).unwrap();

        assert_eq!(cipher.decrypt(&sealed).unwrap(), br#"{"message":"hi"}"#);

        let other = ChannelCipher::from_material(&KeyMaterial::partition(302));
        assert_eq!(other.decrypt(&sealed), Err(CipherError::Authentication));
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let cipher = ChannelCipher::new(ChannelKey::derive("pub"));
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_payloads() {
        let cipher = ChannelCipher::new(ChannelKey::derive("pub"));
        assert_eq!(cipher.decrypt(b"!!!not base64"), Err(CipherError::Encoding));
        assert_eq!(cipher.decrypt(b"AAAA"), Err(CipherError::Truncated));
    }
}
