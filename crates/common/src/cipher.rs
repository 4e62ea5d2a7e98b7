//! The symmetric cipher capability consumed by the engine.

use crate::error::EncryptionError;

/// Stateless encrypt/decrypt of byte payloads under a raw key and IV.
///
/// The block-cipher mode and padding are a swappable implementation detail;
/// the contract fixes only the key length (32 bytes) and IV length
/// (16 bytes). CPU-bound, so the methods are synchronous — the engine's
/// suspension points are its cache, store, and vault calls.
pub trait SymmetricCipher: Send + Sync {
    /// Encrypt `data`. Fails with [`EncryptionError::Cipher`] on a key or IV
    /// length mismatch.
    fn encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    /// Decrypt `data`. Fails with [`EncryptionError::Cipher`] on a length
    /// mismatch or malformed ciphertext.
    fn decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}
