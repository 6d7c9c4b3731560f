use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("credential key must be a base64-encoded 32-byte key")]
    InvalidKey,
    #[error("ciphertext must be valid base64")]
    NotBase64,
    #[error("ciphertext too short")]
    TooShort,
    #[error("encrypt error")]
    Encrypt,
    #[error("decrypt error (wrong key or tampered ciphertext)")]
    Decrypt,
    #[error("decrypted secret is not UTF-8")]
    NotUtf8,
}

/// AES-256-GCM for platform secrets at rest. Stored form is base64(nonce || ciphertext).
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CipherError> {
        let key_bytes = general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|_| CipherError::InvalidKey)?;
        if key_bytes.len() != 32 {
            return Err(CipherError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CipherError::InvalidKey)?;
        Ok(SecretCipher { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt a value produced by [`SecretCipher::encrypt`].
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<SecretString, CipherError> {
        let combined = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CipherError::NotBase64)?;
        if combined.len() <= NONCE_LEN {
            return Err(CipherError::TooShort);
        }
        let (nonce_bytes, ct) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ct)
            .map_err(|_| CipherError::Decrypt)?;
        let text = String::from_utf8(plaintext).map_err(|_| CipherError::NotUtf8)?;
        Ok(SecretString::from(text))
    }
}

/// Encrypt with a fresh cipher; used by tooling that seeds `delivery_platforms`.
pub fn encrypt_for_storage(key_b64: &SecretString, plaintext: &str) -> Result<String, CipherError> {
    SecretCipher::from_base64_key(key_b64.expose_secret())?.encrypt(plaintext)
}
