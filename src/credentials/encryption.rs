//! AES-256-GCM vault for OAuth tokens.
//!
//! Each token is encrypted separately with a fresh random nonce. The stored
//! blob is `base64(nonce || ciphertext || tag)`, so a record carries exactly one
//! opaque value per token. The master key must be 32 bytes (256 bits) and is
//! loaded once at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Vault failures. Messages never include plaintext or key material.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid master key: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encryption,
    /// Tampered, truncated or foreign ciphertext. Fatal for the credential.
    #[error("decryption failed (wrong key or corrupted data)")]
    Decryption,
}

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>, VaultError> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|_| VaultError::InvalidKey("not valid base64".to_string()))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(VaultError::InvalidKey(format!(
            "must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// Process-wide token cipher. Read-only after construction.
///
/// # Security
/// - Authenticated encryption (tampering detected)
/// - Never reuses a nonce
/// - `Debug` output never shows the key
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Builds a vault from a base64-encoded 32-byte master key.
    pub fn new(key_base64: &str) -> Result<Self, VaultError> {
        let key_bytes = validate_key(key_base64)?;
        Self::from_key_bytes(&key_bytes)
    }

    pub fn from_key_bytes(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey(format!(
                "must be {} bytes",
                KEY_SIZE
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext` into an opaque base64 blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a blob produced by [`Vault::encrypt`].
    ///
    /// Any modification of the blob yields [`VaultError::Decryption`]; altered
    /// plaintext is never returned.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let blob = BASE64
            .decode(ciphertext)
            .map_err(|_| VaultError::Decryption)?;

        if blob.len() < NONCE_SIZE {
            return Err(VaultError::Decryption);
        }
        let (nonce_bytes, sealed) = blob.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, sealed)
            .map_err(|_| VaultError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decryption)
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Vault { key: [REDACTED] }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::from_key_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_key_validation() {
        // Valid 32-byte key (base64-encoded)
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        // Invalid base64
        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = test_vault();
        let plaintext = "EAAB-access-token-12345";

        let ciphertext = vault.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert!(!ciphertext.contains(plaintext));

        assert_eq!(vault.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_roundtrip_empty_and_large_values() {
        let vault = test_vault();

        let empty = vault.encrypt("").unwrap();
        assert_eq!(vault.decrypt(&empty).unwrap(), "");

        let large = "t".repeat(64 * 1024);
        let sealed = vault.encrypt(&large).unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), large);

        let unicode = "tøken-🔑-値";
        let sealed = vault.encrypt(unicode).unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), unicode);
    }

    #[test]
    fn test_different_nonces() {
        let vault = test_vault();
        let first = vault.encrypt("same-plaintext").unwrap();
        let second = vault.encrypt("same-plaintext").unwrap();

        assert_ne!(first, second);
        assert_eq!(vault.decrypt(&first).unwrap(), "same-plaintext");
        assert_eq!(vault.decrypt(&second).unwrap(), "same-plaintext");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_vault().encrypt("secret").unwrap();
        let other = Vault::from_key_bytes(&[1u8; 32]).unwrap();

        assert_eq!(other.decrypt(&sealed), Err(VaultError::Decryption));
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        let vault = test_vault();
        let sealed = vault.encrypt("refresh-token-value").unwrap();
        let blob = BASE64.decode(&sealed).unwrap();

        for index in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[index] ^= 0x01;
            let tampered = BASE64.encode(&tampered);
            assert_eq!(
                vault.decrypt(&tampered),
                Err(VaultError::Decryption),
                "byte {} was not authenticated",
                index
            );
        }
    }

    #[test]
    fn test_truncated_or_garbage_input_fails() {
        let vault = test_vault();
        assert_eq!(vault.decrypt(""), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("AAAA"), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("%%%"), Err(VaultError::Decryption));
    }

    #[test]
    fn test_debug_hides_key() {
        assert_eq!(format!("{:?}", test_vault()), "Vault { key: [REDACTED] }");
    }
}
