//! Tenant API key encryption at rest.
//!
//! Stored values are `base64(nonce || ciphertext)` under AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;

use crate::error::AiError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl core::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("KeyCipher(..)")
    }
}

impl KeyCipher {
    pub fn new(key: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Build from a base64-encoded 32-byte key (as found in configuration).
    pub fn from_base64(encoded: &str) -> Result<Self, AiError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AiError::Internal(format!("encryption key is not base64: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            AiError::Internal(format!("encryption key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, AiError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AiError::Internal(format!("encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, AiError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AiError::unavailable(format!("stored key is not base64: {e}")))?;

        if combined.len() <= NONCE_LEN {
            return Err(AiError::unavailable("stored key is too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AiError::unavailable("stored key could not be decrypted"))?;

        String::from_utf8(plaintext)
            .map_err(|e| AiError::unavailable(format!("stored key is not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let cipher = KeyCipher::new([7u8; 32]);
        let sealed = cipher.encrypt("sk-test-123").unwrap();
        assert_ne!(sealed, "sk-test-123");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-test-123");
    }

    #[test]
    fn wrong_key_is_provider_unavailable() {
        let sealed = KeyCipher::new([1u8; 32]).encrypt("sk-test").unwrap();
        let err = KeyCipher::new([2u8; 32]).decrypt(&sealed).unwrap_err();
        assert!(matches!(err, AiError::ProviderUnavailable(_)));
    }

    #[test]
    fn from_base64_checks_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(KeyCipher::from_base64(&short).is_err());

        let ok = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        assert!(KeyCipher::from_base64(&ok).is_ok());
    }
}
