//! [`KeyManagementEngine`]: the key-lifecycle orchestrator.
//!
//! Composes the vault, the cipher, and the record store, and owns a second
//! cache namespace for *unwrapped* key material (the record store's own
//! namespace holds only wrapped material).
//!
//! # Rotation saga
//!
//! [`rotate_wrapping_key`](KeyManagementEngine::rotate_wrapping_key) spans
//! three independent stores (vault, relational store, cache) with no
//! cross-store transaction. Steps are strictly ordered and gated on the
//! previous step succeeding; a mid-saga failure stops the saga and is
//! surfaced — committed steps are **not** rolled back. The worst stable
//! outcome is two valid wrapping rows with the old vault version still
//! enabled: degraded, never corrupt.
//!
//! # Concurrency
//!
//! No per-key mutual exclusion is applied. Two concurrent rotations of the
//! same logical key can interleave arbitrarily; callers that rotate
//! concurrently must serialise per logical key externally (e.g. an advisory
//! lock).

use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use access::{KeyRecordStore, NewKeyRecord, UpdateKeyRecord};
use common::cache::{ByteCache, CacheNamespace};
use common::cipher::SymmetricCipher;
use common::ensure_active;
use common::error::EncryptionError;
use common::keys::{
    KeyRecord, LogicalKeyDefinition, LogicalKeyId, RawKeyBytes, UnwrappedKeyMaterial,
    WrappingKeyDefinition, IV_LEN, KEY_LEN,
};
use common::options::CacheOptions;
use common::vault::AsymmetricKeyVault;

/// Cache namespace prefix for unwrapped key material. Distinct from the
/// record store's namespace: entries here hold plaintext DEK bytes.
const UNWRAPPED_KEY_PREFIX: &str = "UnwrappedKey";

/// Orchestrates key creation, encryption dispatch, and KEK rotation.
pub struct KeyManagementEngine {
    vault: Arc<dyn AsymmetricKeyVault>,
    cipher: Arc<dyn SymmetricCipher>,
    records: Arc<KeyRecordStore>,
    unwrapped_cache: CacheNamespace,
}

impl KeyManagementEngine {
    pub fn new(
        vault: Arc<dyn AsymmetricKeyVault>,
        cipher: Arc<dyn SymmetricCipher>,
        records: Arc<KeyRecordStore>,
        cache: Arc<dyn ByteCache>,
        options: &CacheOptions,
    ) -> Self {
        Self {
            vault,
            cipher,
            records,
            unwrapped_cache: CacheNamespace::new(cache, UNWRAPPED_KEY_PREFIX, options.ttl()),
        }
    }

    /// Generate a fresh DEK + IV, create a named wrapping key in the vault,
    /// wrap the DEK under it, persist the wrapping, and cache the unwrapped
    /// material. Returns the new definitions.
    ///
    /// Creation is purely additive: a failure part-way wastes at most a
    /// vault key version and never corrupts state, so nothing is cleaned up.
    pub async fn create_keys(
        &self,
        logical_key_name: &str,
        wrapping_key_name: &str,
        ct: &CancellationToken,
    ) -> Result<(LogicalKeyDefinition, WrappingKeyDefinition), EncryptionError> {
        validate_name(logical_key_name, "logical_key_name")?;
        validate_name(wrapping_key_name, "wrapping_key_name")?;

        let raw_key = RawKeyBytes::new(generate_random(KEY_LEN));
        let iv = generate_random(IV_LEN);

        info!(logical_key_name, wrapping_key_name, "creating key pair");

        let material = self
            .wrap_under_new_wrapping_key(
                LogicalKeyId::generate(),
                raw_key,
                iv,
                logical_key_name,
                wrapping_key_name,
                ct,
            )
            .await?;

        ensure_active(ct)?;
        let registered = self
            .records
            .register(new_record_from(&material), ct)
            .await?;

        ensure_active(ct)?;
        self.unwrapped_cache
            .set(&material.logical_key_id, &material)
            .await?;

        Ok(definitions_from(&registered))
    }

    /// Encrypt `data` under the active DEK for `logical_key_id`.
    pub async fn encrypt(
        &self,
        logical_key_id: LogicalKeyId,
        data: &[u8],
        ct: &CancellationToken,
    ) -> Result<Vec<u8>, EncryptionError> {
        validate_payload(data)?;
        let material = self.resolve_key_material(logical_key_id, ct).await?;
        self.cipher.encrypt(
            data,
            material.raw_key.as_slice(),
            &material.initialization_vector,
        )
    }

    /// Decrypt `data` under the active DEK for `logical_key_id`.
    ///
    /// Rotation changes only the wrapping, never the DEK or IV, so payloads
    /// encrypted before a rotation still decrypt afterwards.
    pub async fn decrypt(
        &self,
        logical_key_id: LogicalKeyId,
        data: &[u8],
        ct: &CancellationToken,
    ) -> Result<Vec<u8>, EncryptionError> {
        validate_payload(data)?;
        let material = self.resolve_key_material(logical_key_id, ct).await?;
        self.cipher.decrypt(
            data,
            material.raw_key.as_slice(),
            &material.initialization_vector,
        )
    }

    /// Re-wrap the DEK under a new version of its wrapping key and retire
    /// the old version.
    ///
    /// Forward-only saga; see the module docs for the failure model. A
    /// failure before the new row is registered leaves the old material
    /// fully usable — rotation was a no-op from the caller's perspective.
    pub async fn rotate_wrapping_key(
        &self,
        logical_key_id: LogicalKeyId,
        ct: &CancellationToken,
    ) -> Result<(LogicalKeyDefinition, WrappingKeyDefinition), EncryptionError> {
        // 1. Resolve the current material; unresolvable keys cannot rotate.
        let old = self.resolve_key_material(logical_key_id, ct).await?;

        info!(
            %logical_key_id,
            old_wrapping_key_id = %old.wrapping_key_id,
            "rotating wrapping key"
        );

        // 2–3. New version of the same-named wrapping key; re-wrap the same
        // DEK bytes and IV under it.
        let new = self
            .wrap_under_new_wrapping_key(
                old.logical_key_id,
                old.raw_key.clone(),
                old.initialization_vector.clone(),
                &old.logical_key_name,
                &old.wrapping_key_name,
                ct,
            )
            .await?;

        // Only the wrapping version may change.
        debug_assert_eq!(old.logical_key_id, new.logical_key_id);
        debug_assert_ne!(old.wrapping_key_id, new.wrapping_key_id);
        debug_assert_eq!(old.wrapping_key_name, new.wrapping_key_name);

        // 4. Persist the new wrapping row. On failure the old material is
        // untouched and still active.
        ensure_active(ct)?;
        let registered = self.records.register(new_record_from(&new), ct).await?;

        // 5. Re-cache the unwrapped material: evict, then write the new.
        ensure_active(ct)?;
        self.unwrapped_cache.delete(&old.logical_key_id).await?;
        self.unwrapped_cache
            .set(&new.logical_key_id, &new)
            .await?;

        // 6. Disable the old vault version. From here on a failure leaves
        // two valid wrapping rows — degraded but not corrupt.
        ensure_active(ct)?;
        self.vault
            .disable_key(&old.wrapping_key_name, &old.wrapping_key_version)
            .await?;

        // 7. Mark the old row disabled.
        ensure_active(ct)?;
        let updated = self
            .records
            .update(
                UpdateKeyRecord {
                    logical_key_id: old.logical_key_id,
                    wrapping_key_id: old.wrapping_key_id.clone(),
                    logical_key_name: old.logical_key_name.clone(),
                    wrapping_key_name: old.wrapping_key_name.clone(),
                    wrapping_key_version: old.wrapping_key_version.clone(),
                    wrapped_key: old.wrapped_key.clone(),
                    initialization_vector: old.initialization_vector.clone(),
                    is_disabled: true,
                },
                ct,
            )
            .await?;
        if updated.is_none() {
            warn!(
                %logical_key_id,
                wrapping_key_id = %old.wrapping_key_id,
                "old key record vanished before it could be disabled"
            );
            return Err(EncryptionError::KeyNotFound(logical_key_id));
        }

        // 8. Soft-delete the old row.
        ensure_active(ct)?;
        let removed = self
            .records
            .remove(logical_key_id, &old.wrapping_key_id, ct)
            .await?;
        if !removed {
            warn!(
                %logical_key_id,
                wrapping_key_id = %old.wrapping_key_id,
                "old key record vanished before it could be removed"
            );
            return Err(EncryptionError::KeyNotFound(logical_key_id));
        }

        info!(
            %logical_key_id,
            new_wrapping_key_id = %new.wrapping_key_id,
            "rotation complete"
        );

        // 9. The new definitions.
        Ok(definitions_from(&registered))
    }

    /// Summary of the active wrapping row for `logical_key_id`.
    pub async fn view_logical_key_definition(
        &self,
        logical_key_id: LogicalKeyId,
        ct: &CancellationToken,
    ) -> Result<LogicalKeyDefinition, EncryptionError> {
        let record = self
            .records
            .view_latest(logical_key_id, ct)
            .await?
            .ok_or(EncryptionError::KeyNotFound(logical_key_id))?;
        Ok(logical_definition_from(&record))
    }

    /// Definition of one wrapping-key version, straight from the vault.
    pub async fn view_wrapping_key_definition(
        &self,
        name: &str,
        version: &str,
        ct: &CancellationToken,
    ) -> Result<WrappingKeyDefinition, EncryptionError> {
        validate_name(name, "wrapping_key_name")?;
        validate_name(version, "wrapping_key_version")?;
        ensure_active(ct)?;
        self.vault.view_key_definition(name, version).await
    }

    /// The cache key under which unwrapped material for `id` is stored.
    pub fn unwrapped_cache_key(&self, id: &LogicalKeyId) -> String {
        self.unwrapped_cache.cache_key(id)
    }

    /// Create a new version of the named wrapping key and wrap `raw_key`
    /// under it, producing the assembled unwrapped material.
    async fn wrap_under_new_wrapping_key(
        &self,
        logical_key_id: LogicalKeyId,
        raw_key: RawKeyBytes,
        initialization_vector: Vec<u8>,
        logical_key_name: &str,
        wrapping_key_name: &str,
        ct: &CancellationToken,
    ) -> Result<UnwrappedKeyMaterial, EncryptionError> {
        ensure_active(ct)?;
        let definition = self.vault.create_key(wrapping_key_name).await?;
        debug_assert_eq!(definition.name, wrapping_key_name);

        ensure_active(ct)?;
        let wrapped_key = self
            .vault
            .wrap_key(&definition.name, &definition.version, raw_key.as_slice())
            .await?;

        Ok(UnwrappedKeyMaterial {
            logical_key_id,
            logical_key_name: logical_key_name.to_owned(),
            wrapping_key_id: definition.id,
            wrapping_key_name: definition.name,
            wrapping_key_version: definition.version,
            wrapped_key,
            raw_key,
            initialization_vector,
        })
    }

    /// Resolve the active unwrapped material: cache hit, else latest record
    /// plus a vault unwrap.
    ///
    /// The read path intentionally does not repopulate the unwrapped cache —
    /// only creation and rotation write it, so a miss costs one unwrap per
    /// call until the next rotation refreshes the entry.
    async fn resolve_key_material(
        &self,
        logical_key_id: LogicalKeyId,
        ct: &CancellationToken,
    ) -> Result<UnwrappedKeyMaterial, EncryptionError> {
        ensure_active(ct)?;
        if let Some(material) = self.unwrapped_cache.get(&logical_key_id).await? {
            return Ok(material);
        }

        let record = self
            .records
            .view_latest(logical_key_id, ct)
            .await?
            .ok_or(EncryptionError::KeyNotFound(logical_key_id))?;

        if record.is_disabled {
            warn!(%logical_key_id, "latest key record is disabled");
            return Err(EncryptionError::KeyNotFound(logical_key_id));
        }

        ensure_active(ct)?;
        let raw = self
            .vault
            .unwrap_key(
                &record.wrapping_key_name,
                &record.wrapping_key_version,
                &record.wrapped_key,
            )
            .await?;

        Ok(UnwrappedKeyMaterial {
            logical_key_id: record.logical_key_id,
            logical_key_name: record.logical_key_name,
            wrapping_key_id: record.wrapping_key_id,
            wrapping_key_name: record.wrapping_key_name,
            wrapping_key_version: record.wrapping_key_version,
            wrapped_key: record.wrapped_key,
            raw_key: RawKeyBytes::new(raw),
            initialization_vector: record.initialization_vector,
        })
    }
}

fn generate_random(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

fn new_record_from(material: &UnwrappedKeyMaterial) -> NewKeyRecord {
    NewKeyRecord {
        logical_key_id: material.logical_key_id,
        wrapping_key_id: material.wrapping_key_id.clone(),
        logical_key_name: material.logical_key_name.clone(),
        wrapping_key_name: material.wrapping_key_name.clone(),
        wrapping_key_version: material.wrapping_key_version.clone(),
        wrapped_key: material.wrapped_key.clone(),
        initialization_vector: material.initialization_vector.clone(),
    }
}

fn logical_definition_from(record: &KeyRecord) -> LogicalKeyDefinition {
    LogicalKeyDefinition {
        id: record.logical_key_id,
        name: record.logical_key_name.clone(),
        is_enabled: !record.is_disabled,
        created_at: record.created_at,
    }
}

fn definitions_from(record: &KeyRecord) -> (LogicalKeyDefinition, WrappingKeyDefinition) {
    (
        logical_definition_from(record),
        WrappingKeyDefinition {
            id: record.wrapping_key_id.clone(),
            name: record.wrapping_key_name.clone(),
            version: record.wrapping_key_version.clone(),
            is_enabled: !record.is_disabled,
            created_at: record.created_at,
        },
    )
}

fn validate_name(value: &str, field: &str) -> Result<(), EncryptionError> {
    if value.trim().is_empty() {
        return Err(EncryptionError::Validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn validate_payload(data: &[u8]) -> Result<(), EncryptionError> {
    if data.is_empty() {
        return Err(EncryptionError::Validation(
            "payload must not be empty".into(),
        ));
    }
    Ok(())
}
