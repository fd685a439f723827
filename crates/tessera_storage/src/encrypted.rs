//! Encrypted object backend wrapper.
//!
//! This module provides an object backend that wraps any other backend
//! with AES-256-GCM encryption at rest.
//!
//! ## Security Model
//!
//! - Each object is encrypted independently with a fresh random nonce
//! - Object structure: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! - The object key is bound as associated data, so an object copied to
//!   another key fails authentication
//! - Keys are never stored; they must be provided by the application

use crate::backend::ObjectBackend;
use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for the encrypted backend.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from high-entropy secret material using HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive(secret: &[u8], salt: &[u8]) -> StorageResult<Self> {
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"tessera-object-key-v1", &mut bytes)
            .map_err(|_| StorageError::Encryption("HKDF expand failed".to_string()))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// An object backend that encrypts every object before handing it to an
/// inner backend.
///
/// Keys and listings pass through unchanged; only object contents are
/// encrypted.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{EncryptedBackend, EncryptionKey, InMemoryBackend, ObjectBackend};
///
/// let backend = EncryptedBackend::new(InMemoryBackend::new(), EncryptionKey::generate());
/// backend.put("k", b"secret").unwrap();
/// assert_eq!(&backend.get("k").unwrap()[..], b"secret");
/// ```
pub struct EncryptedBackend<B> {
    inner: B,
    cipher: Aes256Gcm,
}

impl<B: ObjectBackend> EncryptedBackend<B> {
    /// Creates a new encrypted backend wrapping the given inner backend.
    pub fn new(inner: B, key: EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { inner, cipher }
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Encryption("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &str, data: &[u8]) -> StorageResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::Encryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Encryption("authentication failed".to_string()))
    }
}

impl<B: ObjectBackend> ObjectBackend for EncryptedBackend<B> {
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let encrypted = self.encrypt(key, data)?;
        self.inner.put(key, &encrypted)
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        let encrypted = self.inner.get(key)?;
        self.decrypt(key, &encrypted).map(Bytes::from)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

impl<B> std::fmt::Debug for EncryptedBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend").finish_non_exhaustive()
    }
}
