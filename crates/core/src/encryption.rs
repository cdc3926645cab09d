//! Symmetric encryption of plugin connection credentials at rest.
//!
//! [`EncryptionService`] derives a single AES-256-GCM key from the
//! application secret (SHA-256 of the secret) and seals JSON objects into an
//! opaque base64 string: `base64(nonce || ciphertext || tag)`.
//!
//! Every call to [`EncryptionService::encrypt`] uses a fresh random 96-bit
//! nonce. Tampered or truncated ciphertext fails authentication and is
//! reported as [`EncryptionError::Decryption`], never as wrong plaintext.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failures while sealing or opening credential blobs.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// The application secret is empty or unusable as key material.
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    /// The ciphertext string is not valid base64 or is too short.
    #[error("Malformed ciphertext: {0}")]
    Encoding(String),

    /// Authentication failed: wrong key, or tampered/corrupted data.
    #[error("Decryption failed: ciphertext was tampered with or the key is wrong")]
    Decryption,

    /// Decryption succeeded but the plaintext is not a JSON object.
    #[error("Decrypted payload is not a valid JSON object: {0}")]
    MalformedPayload(String),

    /// The plaintext could not be serialized before encryption.
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption failed")]
    Encryption,
}

// ---------------------------------------------------------------------------
// EncryptionService
// ---------------------------------------------------------------------------

/// Seals and opens connection-config dictionaries.
///
/// Constructed once at process start and shared via `Arc`.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Derive the credential key from the application-wide secret.
    pub fn new(secret: &str) -> Result<Self, EncryptionError> {
        if secret.is_empty() {
            return Err(EncryptionError::InvalidKey(
                "application secret must not be empty".into(),
            ));
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a JSON object into an opaque ciphertext string.
    pub fn encrypt(
        &self,
        value: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, EncryptionError> {
        let plaintext = serde_json::to_vec(value)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| EncryptionError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypt a ciphertext string produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(
        &self,
        ciphertext: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, EncryptionError> {
        let blob = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| EncryptionError::Encoding(e.to_string()))?;

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::Encoding(format!(
                "ciphertext is {} bytes, expected at least {}",
                blob.len(),
                NONCE_LEN + TAG_LEN
            )));
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| EncryptionError::Decryption)?;

        match serde_json::from_slice::<serde_json::Value>(&plaintext) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(EncryptionError::MalformedPayload(format!(
                "expected object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(EncryptionError::MalformedPayload(e.to_string())),
        }
    }
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService").finish_non_exhaustive()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
