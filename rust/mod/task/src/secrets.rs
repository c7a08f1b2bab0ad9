//! Decryption of account secrets (wallet keys, passwords).
//!
//! Ciphertext format: base64 of `nonce (12 bytes) || AES-256-GCM output`.
//! An empty string stands for "no secret" and maps to an empty string in
//! both directions.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// Turns stored secret fields into plaintext for the duration of a run.
/// Implementations must be side-effect free.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;

    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;
}

/// AES-256-GCM with a random nonce per value.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, SecretError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(key: &str) -> Result<Self, SecretError> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Self::new(&bytes)
    }

    /// Generate a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key[..]);
        BASE64.encode(key)
    }
}

impl SecretCipher for AesGcmCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let combined = BASE64
            .decode(ciphertext)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        if combined.len() <= NONCE_LEN {
            return Err(SecretError::Malformed("too short".into()));
        }
        let (nonce, body) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|e| SecretError::Malformed(e.to_string()))
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let body = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(body);
        Ok(BASE64.encode(combined))
    }
}

/// Identity cipher for deployments that keep secrets unencrypted.
pub struct PlaintextCipher;

impl SecretCipher for PlaintextCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        Ok(ciphertext.to_string())
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        Ok(plaintext.to_string())
    }
}
