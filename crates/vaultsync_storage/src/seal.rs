//! At-rest sealing of records with AES-256-GCM.
//!
//! Pending operations carry a plaintext snapshot of the item they describe,
//! so a persisted queue holds credentials. Stores opened with a
//! [`SealingKey`] seal every record before it is framed.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use crate::error::{StorageError, StorageResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a sealing key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the per-record GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Key used to seal persisted records. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey {
    bytes: [u8; KEY_SIZE],
}

impl SealingKey {
    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Builds a key from exactly [`KEY_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Seal`] if `bytes` has the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            StorageError::Seal(format!(
                "sealing key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw key bytes. Never log the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens individual records.
pub struct RecordSealer {
    cipher: Aes256Gcm,
}

impl RecordSealer {
    /// Creates a sealer for `key`.
    #[must_use]
    pub fn new(key: &SealingKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Seal`] if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StorageError::Seal("record encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a record produced by [`RecordSealer::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Seal`] if the record is too short, was sealed
    /// under another key, or was modified.
    pub fn open(&self, sealed: &[u8]) -> StorageResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(StorageError::Seal(format!(
                "sealed record too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Seal("record authentication failed (wrong key?)".into()))
    }
}

impl std::fmt::Debug for RecordSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSealer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let sealer = RecordSealer::new(&SealingKey::generate());
        let sealed = sealer.seal(b"hunter2").unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"hunter2");
        assert_eq!(sealer.open(&sealed).unwrap(), b"hunter2");
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let sealer = RecordSealer::new(&SealingKey::generate());
        assert_ne!(sealer.seal(b"x").unwrap(), sealer.seal(b"x").unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = RecordSealer::new(&SealingKey::generate())
            .seal(b"secret")
            .unwrap();
        let other = RecordSealer::new(&SealingKey::generate());
        assert!(matches!(other.open(&sealed), Err(StorageError::Seal(_))));
    }

    #[test]
    fn tampering_is_detected() {
        let sealer = RecordSealer::new(&SealingKey::generate());
        let mut sealed = sealer.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sealer.open(&sealed).is_err());
        assert!(sealer.open(&sealed[..4]).is_err());
    }

    #[test]
    fn key_length_is_checked() {
        assert!(SealingKey::from_bytes(&[0u8; 16]).is_err());
        let key = SealingKey::from_bytes(&[7u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_SIZE]);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
