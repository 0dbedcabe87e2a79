//! Symmetric encryption for stored credentials
//!
//! AES-256-GCM with a fresh 96-bit nonce per message. Ciphertexts are
//! URL-safe base64 (unpadded) of `nonce || ciphertext || tag`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{AppError, AppResult};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Process-wide cipher holding the credential encryption key
pub struct CipherService {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CipherService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherService").finish_non_exhaustive()
    }
}

impl CipherService {
    /// Build a cipher from a URL-safe base64 key (padded or unpadded)
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the key is not base64 or not 32 bytes long.
    pub fn from_encoded_key(encoded: &SecretString) -> AppResult<Self> {
        let raw = encoded.expose_secret().trim();
        let bytes = URL_SAFE
            .decode(raw)
            .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
            .map_err(|_| AppError::invalid("ENCRYPTION_KEY must be URL-safe base64"))?;
        if bytes.len() != KEY_LEN {
            return Err(AppError::InvalidInput(format!(
                "ENCRYPTION_KEY must decode to {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a UTF-8 payload
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Internal("credential encryption failed".to_owned()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Decrypt a payload produced by [`CipherService::encrypt`]
    ///
    /// # Errors
    ///
    /// Returns `Decryption` for malformed input, truncated input, a failed
    /// authentication tag (tampering or wrong key), or non-UTF-8 plaintext.
    pub fn decrypt(&self, ciphertext: &str) -> AppResult<String> {
        let raw = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|_| AppError::Decryption("ciphertext is not valid base64".to_owned()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Decryption("ciphertext is truncated".to_owned()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| {
                AppError::Decryption("authentication tag mismatch (tampered or wrong key)".to_owned())
            })?;

        String::from_utf8(opened)
            .map_err(|_| AppError::Decryption("plaintext is not valid UTF-8".to_owned()))
    }
}
