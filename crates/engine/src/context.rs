//! [`EncryptionContext`] and the typed-value convenience surface.
//!
//! A context is the caller-facing handle for one logical key: a small value
//! struct carrying the [`LogicalKeyId`], cheap to copy, serialisable so
//! callers can persist it next to the data it protects. The typed helpers on
//! [`KeyManagementEngine`] serialise values as JSON before encryption, so any
//! `Serialize`/`DeserializeOwned` type goes through the byte-level engine
//! operations unchanged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::error::EncryptionError;
use common::keys::{LogicalKeyDefinition, LogicalKeyId, WrappingKeyDefinition};

use crate::engine::KeyManagementEngine;

/// Handle to one logical key, as held by data owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub logical_key_id: LogicalKeyId,
}

impl EncryptionContext {
    pub fn new(logical_key_id: LogicalKeyId) -> Self {
        Self { logical_key_id }
    }
}

impl From<&LogicalKeyDefinition> for EncryptionContext {
    fn from(definition: &LogicalKeyDefinition) -> Self {
        Self::new(definition.id)
    }
}

impl KeyManagementEngine {
    /// Create a key pair under a random wrapping-key name and return the
    /// context for it alongside the definitions.
    ///
    /// For callers that manage one wrapping key per logical key and have no
    /// naming scheme of their own.
    pub async fn create_context(
        &self,
        logical_key_name: &str,
        ct: &CancellationToken,
    ) -> Result<
        (
            EncryptionContext,
            LogicalKeyDefinition,
            WrappingKeyDefinition,
        ),
        EncryptionError,
    > {
        let wrapping_key_name = Uuid::new_v4().to_string();
        let (logical, wrapping) = self
            .create_keys(logical_key_name, &wrapping_key_name, ct)
            .await?;
        Ok((EncryptionContext::from(&logical), logical, wrapping))
    }

    /// Serialise `value` as JSON and encrypt it under the context's key.
    pub async fn encrypt_value<T: Serialize>(
        &self,
        context: EncryptionContext,
        value: &T,
        ct: &CancellationToken,
    ) -> Result<Vec<u8>, EncryptionError> {
        let plain = serde_json::to_vec(value)
            .map_err(|e| EncryptionError::Validation(format!("value is not serialisable: {e}")))?;
        self.encrypt(context.logical_key_id, &plain, ct).await
    }

    /// Decrypt `data` under the context's key and deserialise it as JSON.
    pub async fn decrypt_value<T: DeserializeOwned>(
        &self,
        context: EncryptionContext,
        data: &[u8],
        ct: &CancellationToken,
    ) -> Result<T, EncryptionError> {
        let plain = self.decrypt(context.logical_key_id, data, ct).await?;
        serde_json::from_slice(&plain).map_err(|e| {
            EncryptionError::Cipher(format!("decrypted payload is not a valid value: {e}"))
        })
    }

    /// Rotate the wrapping key behind the context. The context itself is
    /// unchanged; only the wrapping version moves.
    pub async fn rotate(
        &self,
        context: EncryptionContext,
        ct: &CancellationToken,
    ) -> Result<(LogicalKeyDefinition, WrappingKeyDefinition), EncryptionError> {
        self.rotate_wrapping_key(context.logical_key_id, ct).await
    }
}
