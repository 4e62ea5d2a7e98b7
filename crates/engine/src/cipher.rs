//! AES-256-CBC payload encryption with PKCS#7 padding.
//!
//! The IV is part of the persisted key record and is reused across payloads
//! for a given wrapping, so ciphertext is deterministic per (DEK, IV) pair.
//! The mode is a swappable capability behind [`SymmetricCipher`]; only the
//! key length (32 bytes) and IV length (16 bytes) are contractual.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use common::cipher::SymmetricCipher;
use common::error::EncryptionError;
use common::keys::{IV_LEN, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Stateless AES-256-CBC implementation of [`SymmetricCipher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbcCipher;

impl AesCbcCipher {
    pub fn new() -> Self {
        Self
    }
}

fn check_inputs(key: &[u8], iv: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != KEY_LEN {
        return Err(EncryptionError::Cipher(format!(
            "key must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if iv.len() != IV_LEN {
        return Err(EncryptionError::Cipher(format!(
            "initialization vector must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    Ok(())
}

impl SymmetricCipher for AesCbcCipher {
    fn encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        check_inputs(key, iv)?;
        let enc = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    fn decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        check_inputs(key, iv)?;
        let dec = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| EncryptionError::Cipher("malformed ciphertext or padding".into()))
    }
}
