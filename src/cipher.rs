//! Authenticated encryption of API key secrets at rest.
//!
//! Uses AES-256-GCM with a fresh random nonce per encryption, stored
//! alongside the ciphertext. A nonce derived from a stable identifier
//! (e.g. the key id) would be reused across rotations of the same secret
//! and break GCM's confidentiality guarantee — every call here draws a
//! new nonce from the OS RNG instead.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),
}

/// Authenticated encryption for secrets stored in the API key table.
pub trait SecretCipher: Send + Sync {
    /// Returns `(ciphertext, nonce)`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CipherError>;
    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CipherError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CipherError> {
        if key_bytes.len() != 32 {
            return Err(CipherError::BadKeyLength(key_bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CipherError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;
        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CipherError> {
        if nonce.len() != 12 {
            return Err(CipherError::Decrypt);
        }
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = AesGcmCipher::new(&test_key()).unwrap();
        let (ciphertext, nonce) = cipher.encrypt(b"super-secret-value").unwrap();
        let plaintext = cipher.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"super-secret-value");
    }

    #[test]
    fn successive_encryptions_use_distinct_nonces() {
        let cipher = AesGcmCipher::new(&test_key()).unwrap();
        let (_, nonce_a) = cipher.encrypt(b"same-plaintext").unwrap();
        let (_, nonce_b) = cipher.encrypt(b"same-plaintext").unwrap();
        assert_ne!(nonce_a, nonce_b);
    }

    #[test]
    fn rejects_short_key() {
        assert!(AesGcmCipher::new(b"too-short").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let cipher = AesGcmCipher::new(&test_key()).unwrap();
        let (mut ciphertext, nonce) = cipher.encrypt(b"data").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(cipher.decrypt(&ciphertext, &nonce).is_err());
    }
}
