//! Symmetric sealing of storage configuration at rest.
//!
//! - Key derivation: HKDF-SHA256 over the configured passphrase
//! - Cipher: XChaCha20-Poly1305 with a random 192-bit nonce per seal
//! - Encoding: base64(`nonce || ciphertext`)
//!
//! The repository calls [`ConfigCipher::seal`] on save and
//! [`ConfigCipher::open`] on load; nothing else touches sealed text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::config::SecurityConfig;
use crate::error::AppError;
use crate::result::AppResult;

/// Size of the derived key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce in bytes (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Seals and opens storage configuration blobs.
#[derive(Clone)]
pub struct ConfigCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for ConfigCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCipher").finish_non_exhaustive()
    }
}

impl ConfigCipher {
    /// Derive a cipher from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> AppResult<Self> {
        if passphrase.is_empty() {
            return Err(AppError::configuration(
                "security.crypt is enabled but security.crypt_key is empty",
            ));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(b"stowage-config-v1"), passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"storage-config-encryption", &mut key)
            .map_err(|e| AppError::crypto(format!("Key derivation failed: {e}")))?;

        Ok(Self { key })
    }

    /// Build a cipher from the security section, or `None` when sealing is off.
    pub fn from_config(config: &SecurityConfig) -> AppResult<Option<Self>> {
        if !config.crypt {
            return Ok(None);
        }
        Self::from_passphrase(&config.crypt_key).map(Some)
    }

    /// Seal plaintext into base64(`nonce || ciphertext`).
    pub fn seal(&self, plaintext: &[u8]) -> AppResult<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| AppError::crypto(format!("Nonce generation failed: {e}")))?;

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| AppError::crypto(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| AppError::crypto(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open a blob produced by [`ConfigCipher::seal`].
    pub fn open(&self, sealed: &str) -> AppResult<Vec<u8>> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|e| AppError::crypto(format!("Sealed config is not base64: {e}")))?;
        if raw.len() <= NONCE_SIZE {
            return Err(AppError::crypto("Sealed config is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| AppError::crypto(e.to_string()))?;
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::crypto("Failed to decrypt storage config (wrong key?)"))
    }
}
