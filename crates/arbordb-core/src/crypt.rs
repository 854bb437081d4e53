//! Attribute-level encryption hooks.
//!
//! The engine never generates or stores key material; it holds one provider
//! handle per encrypted attribute and calls it at exactly two boundaries:
//! entry values on the `id2entry` path, and the value part of index keys.
//! Index-key encryption must be deterministic so equality lookups still
//! work; entry-value encryption uses a fresh nonce per value.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of the AES-GCM nonce prefixed to each encrypted entry value.
const NONCE_LEN: usize = 12;

/// An attribute-encryption provider.
///
/// Implementations are polymorphic over key-material source and cipher;
/// the built-in one is [`AesGcmCrypt`].
pub trait AttrCrypt: Send + Sync {
    /// Cipher name, for configuration round-trips and logs.
    fn name(&self) -> &str;

    /// Encrypts one entry value (non-deterministic).
    ///
    /// # Errors
    ///
    /// [`Error::Crypt`] on cipher failure.
    fn encrypt_value(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`AttrCrypt::encrypt_value`].
    ///
    /// # Errors
    ///
    /// [`Error::Crypt`] on malformed or forged input.
    fn decrypt_value(&self, cipher: &[u8]) -> Result<Vec<u8>>;

    /// Encrypts the value part of an index key (deterministic: equal
    /// plaintexts must map to equal key material).
    ///
    /// # Errors
    ///
    /// [`Error::Crypt`] on cipher failure.
    fn encrypt_index_key(&self, plain: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM provider over caller-supplied key material.
pub struct AesGcmCrypt {
    cipher: Aes256Gcm,
}

impl AesGcmCrypt {
    /// Builds a provider from a 256-bit key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }
}

impl AttrCrypt for AesGcmCrypt {
    fn name(&self) -> &str {
        "aes-256-gcm"
    }

    fn encrypt_value(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| Error::Crypt(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt_value(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        if cipher.len() < NONCE_LEN {
            return Err(Error::Crypt("ciphertext shorter than nonce".into()));
        }
        let (nonce, sealed) = cipher.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| Error::Crypt(e.to_string()))
    }

    fn encrypt_index_key(&self, plain: &[u8]) -> Result<Vec<u8>> {
        // Fixed nonce keeps the mapping deterministic; index keys leak
        // only equality, the same as any searchable encryption.
        let nonce = [0u8; NONCE_LEN];
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| Error::Crypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AesGcmCrypt {
        AesGcmCrypt::new(&[7u8; 32])
    }

    #[test]
    fn value_round_trip() {
        let p = provider();
        let sealed = p.encrypt_value(b"secret value").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret value");
        assert_eq!(p.decrypt_value(&sealed).unwrap(), b"secret value");
    }

    #[test]
    fn value_encryption_is_randomized() {
        let p = provider();
        let a = p.encrypt_value(b"same").unwrap();
        let b = p.encrypt_value(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn index_key_encryption_is_deterministic() {
        let p = provider();
        let a = p.encrypt_index_key(b"same").unwrap();
        let b = p.encrypt_index_key(b"same").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, p.encrypt_index_key(b"other").unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let p = provider();
        let mut sealed = p.encrypt_value(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(p.decrypt_value(&sealed).is_err());
    }
}
