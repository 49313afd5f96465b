//! Encryption at rest for stored documents.
//!
//! Documents are sealed with AES-256-GCM. The stored form is
//! `base64(nonce || ciphertext || tag)` with a fresh 12-byte nonce drawn
//! from the OS RNG for every call to [`CryptoCodec::encode`].

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, StoreError};
use crate::types::Content;

/// Nonce length for AES-GCM (12 bytes standard)
pub const NONCE_LENGTH: usize = 12;

/// Key length for AES-256 (32 bytes)
pub const KEY_LENGTH: usize = 32;

/// GCM authentication tag length.
pub const TAG_LENGTH: usize = 16;

/// Authenticated symmetric codec bound to one key.
#[derive(Clone)]
pub struct CryptoCodec {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CryptoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoCodec(<redacted>)")
    }
}

impl CryptoCodec {
    /// Create a codec from raw key bytes (must be 32 bytes).
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(StoreError::Config(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| StoreError::Config(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Create a codec from a base64-encoded key.
    pub fn from_base64(key: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| StoreError::Config(format!("Encryption key is not base64: {}", e)))?;
        Self::new(&bytes)
    }

    /// Generate a random key, base64-encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        STANDARD.encode(key)
    }

    /// Seal `plaintext` and return the textual storage form.
    pub fn encode(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Serialization(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open the textual storage form produced by [`encode`](Self::encode).
    ///
    /// Any malformation, including a bad base64 body or a truncated frame,
    /// is reported as `Authentication`: tampered input is indistinguishable
    /// from corrupt input and neither is retried.
    pub fn decode(&self, encoded: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(encoded.as_ref())
            .map_err(|e| StoreError::Authentication(format!("Ciphertext is not base64: {}", e)))?;

        if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(StoreError::Authentication(format!(
                "Ciphertext too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Authentication("Authentication tag mismatch".into()))
    }

    /// Seal a JSON document.
    pub fn encode_json(&self, content: &Content) -> Result<String> {
        let plaintext = serde_json::to_vec(content)?;
        self.encode(&plaintext)
    }

    /// Open a sealed JSON document.
    pub fn decode_json(&self, encoded: impl AsRef<[u8]>) -> Result<Content> {
        let plaintext = self.decode(encoded)?;
        serde_json::from_slice(&plaintext).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Which paths a codec applies to.
///
/// The rule is fixed for the lifetime of a store, so a given path is always
/// either sealed on every write or never sealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathScope {
    All,
    Suffix(String),
    Paths(BTreeSet<String>),
}

impl PathScope {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathScope::All => true,
            PathScope::Suffix(suffix) => path.ends_with(suffix.as_str()),
            PathScope::Paths(paths) => paths.contains(path),
        }
    }
}

/// A codec together with the paths it seals.
#[derive(Clone, Debug)]
pub struct EncryptionPolicy {
    pub codec: CryptoCodec,
    pub scope: PathScope,
}

impl EncryptionPolicy {
    pub fn new(codec: CryptoCodec, scope: PathScope) -> Self {
        Self { codec, scope }
    }

    /// The codec to use for `path`, if it is sealed.
    pub fn codec_for(&self, path: &str) -> Option<&CryptoCodec> {
        self.scope.matches(path).then_some(&self.codec)
    }
}

/// Serialize content to its stored bytes, sealing it when a codec applies.
pub fn encode_content(content: &Content, codec: Option<&CryptoCodec>) -> Result<Vec<u8>> {
    match codec {
        Some(codec) => Ok(codec.encode_json(content)?.into_bytes()),
        None => Ok(serde_json::to_vec_pretty(content)?),
    }
}

/// Parse stored bytes back into content, opening them when a codec applies.
pub fn decode_content(path: &str, bytes: &[u8], codec: Option<&CryptoCodec>) -> Result<Content> {
    match codec {
        Some(codec) => codec.decode_json(bytes),
        None => serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Deserialization(format!("Invalid JSON in {}: {}", path, e))),
    }
}
