// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Symmetric encryption for secrets at rest.
//!
//! AES-256-GCM with a fresh 96-bit nonce per message, prepended to the
//! ciphertext. Credential secrets are stored base64-encoded; job payloads are
//! stored as raw sealed bytes.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use zeroize::Zeroizing;

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Errors from the secret cipher.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// The key is not exactly [`KEY_LEN`] bytes.
    #[error("Encryption key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Sealing failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The ciphertext could not be opened (tampered, truncated or wrong key).
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// AES-256-GCM cipher keyed from configuration.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build a cipher from a 32-byte key.
    ///
    /// Any other length is rejected the same way on every call.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Encrypt bytes; the output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionFailed(
                "ciphertext shorter than nonce".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt a string and base64-encode the result.
    pub fn seal_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.seal(plaintext.as_bytes())?))
    }

    /// Reverse of [`SecretCipher::seal_str`].
    pub fn open_str(&self, encoded: &str) -> Result<Zeroizing<String>, CryptoError> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::DecryptionFailed(format!("invalid base64: {}", e)))?;
        let plaintext = self.open(&sealed)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| CryptoError::DecryptionFailed("plaintext is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text.to_string()))
    }
}
