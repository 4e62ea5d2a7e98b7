//! Rotation failure-mode tests: a mid-saga vault failure must stop the
//! rotation without rolling back committed steps, and must leave the key
//! fully usable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use access::{KeyRecordStore, UpdateKeyRecord};
use common::cache::{ByteCache, MemoryCache};
use common::error::EncryptionError;
use common::keys::WrappingKeyDefinition;
use common::options::CacheOptions;
use common::vault::AsymmetricKeyVault;
use engine::{AesCbcCipher, KeyManagementEngine};

mock! {
    Vault {}

    #[async_trait]
    impl AsymmetricKeyVault for Vault {
        async fn create_key(&self, name: &str) -> Result<WrappingKeyDefinition, EncryptionError>;
        async fn disable_key(
            &self,
            name: &str,
            version: &str,
        ) -> Result<WrappingKeyDefinition, EncryptionError>;
        async fn enable_key(
            &self,
            name: &str,
            version: &str,
        ) -> Result<WrappingKeyDefinition, EncryptionError>;
        async fn remove_key(
            &self,
            name: &str,
            await_completion: bool,
        ) -> Result<bool, EncryptionError>;
        async fn wrap_key(
            &self,
            name: &str,
            version: &str,
            raw_key: &[u8],
        ) -> Result<Vec<u8>, EncryptionError>;
        async fn unwrap_key(
            &self,
            name: &str,
            version: &str,
            wrapped_key: &[u8],
        ) -> Result<Vec<u8>, EncryptionError>;
        async fn view_key_definition(
            &self,
            name: &str,
            version: &str,
        ) -> Result<WrappingKeyDefinition, EncryptionError>;
    }
}

fn fresh_definition(name: &str) -> WrappingKeyDefinition {
    let version = Uuid::new_v4().to_string();
    WrappingKeyDefinition {
        id: format!("{name}/{version}"),
        name: name.to_owned(),
        version,
        is_enabled: true,
        created_at: Utc::now(),
    }
}

struct Harness {
    engine: KeyManagementEngine,
    records: Arc<KeyRecordStore>,
    cache: Arc<MemoryCache>,
    ct: CancellationToken,
}

fn engine_with(vault: MockVault) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let options = CacheOptions::default();
    let cache = Arc::new(MemoryCache::new());
    let records =
        Arc::new(KeyRecordStore::open_in_memory(cache.clone(), &options).unwrap());
    let engine = KeyManagementEngine::new(
        Arc::new(vault),
        Arc::new(AesCbcCipher::new()),
        records.clone(),
        cache.clone(),
        &options,
    );
    Harness {
        engine,
        records,
        cache,
        ct: CancellationToken::new(),
    }
}

#[tokio::test]
async fn disable_failure_stops_the_saga_without_rollback() {
    let mut vault = MockVault::new();
    // Every create yields a fresh version; wrapping echoes the raw key so the
    // material survives the round trip without real asymmetric crypto.
    vault
        .expect_create_key()
        .returning(|name| Ok(fresh_definition(name)));
    vault
        .expect_wrap_key()
        .returning(|_, _, raw| Ok(raw.to_vec()));
    vault
        .expect_disable_key()
        .times(1)
        .returning(|_, _| Err(EncryptionError::Vault("forced outage".into())));
    // The unwrapped material stays cached throughout, so no unwrap happens.
    vault.expect_unwrap_key().never();

    let h = engine_with(vault);

    let (logical, wrapping_v1) = h
        .engine
        .create_keys("orders-dek", "orders-kek", &h.ct)
        .await
        .unwrap();
    let ciphertext = h.engine.encrypt(logical.id, b"payload", &h.ct).await.unwrap();

    let err = h
        .engine
        .rotate_wrapping_key(logical.id, &h.ct)
        .await
        .unwrap_err();
    assert!(matches!(err, EncryptionError::Vault(_)));

    // Committed steps stand: the new row was registered and the old row was
    // neither disabled nor deleted.
    let old_row = h
        .records
        .view(logical.id, &wrapping_v1.id, &h.ct)
        .await
        .unwrap()
        .expect("old row must survive the aborted rotation");
    assert!(!old_row.is_disabled);

    let latest = h.records.view_latest(logical.id, &h.ct).await.unwrap().unwrap();
    assert_ne!(latest.wrapping_key_id, wrapping_v1.id);

    // The key stays fully usable after the abort.
    let decrypted = h.engine.decrypt(logical.id, &ciphertext, &h.ct).await.unwrap();
    assert_eq!(decrypted, b"payload");
}

#[tokio::test]
async fn rewrap_failure_leaves_old_material_active() {
    let mut vault = MockVault::new();
    let mut wraps = 0u32;
    // The creation's wrap succeeds; the rotation's re-wrap fails, stopping
    // the saga before anything new is persisted.
    vault
        .expect_create_key()
        .returning(|name| Ok(fresh_definition(name)));
    vault.expect_wrap_key().returning(move |_, _, raw| {
        wraps += 1;
        if wraps > 1 {
            Err(EncryptionError::Vault("wrap outage".into()))
        } else {
            Ok(raw.to_vec())
        }
    });
    vault.expect_disable_key().never();
    vault.expect_unwrap_key().never();

    let h = engine_with(vault);

    let (logical, wrapping_v1) = h
        .engine
        .create_keys("orders-dek", "orders-kek", &h.ct)
        .await
        .unwrap();

    let err = h
        .engine
        .rotate_wrapping_key(logical.id, &h.ct)
        .await
        .unwrap_err();
    assert!(matches!(err, EncryptionError::Vault(_)));

    // Nothing was written: the original wrapping row is still the latest.
    let latest = h.records.view_latest(logical.id, &h.ct).await.unwrap().unwrap();
    assert_eq!(latest.wrapping_key_id, wrapping_v1.id);
    assert!(!latest.is_disabled);

    // And the key is still usable.
    let ciphertext = h
        .engine
        .encrypt(logical.id, b"after abort", &h.ct)
        .await
        .unwrap();
    let decrypted = h.engine.decrypt(logical.id, &ciphertext, &h.ct).await.unwrap();
    assert_eq!(decrypted, b"after abort");
}

#[tokio::test]
async fn disabled_latest_record_is_key_not_found() {
    let mut vault = MockVault::new();
    vault
        .expect_create_key()
        .returning(|name| Ok(fresh_definition(name)));
    vault
        .expect_wrap_key()
        .returning(|_, _, raw| Ok(raw.to_vec()));
    // Resolving must refuse the disabled row before reaching the vault.
    vault.expect_unwrap_key().never();

    let h = engine_with(vault);

    let (logical, wrapping) = h
        .engine
        .create_keys("orders-dek", "orders-kek", &h.ct)
        .await
        .unwrap();

    // Disable the only row out of band.
    let row = h
        .records
        .view(logical.id, &wrapping.id, &h.ct)
        .await
        .unwrap()
        .unwrap();
    h.records
        .update(
            UpdateKeyRecord {
                logical_key_id: row.logical_key_id,
                wrapping_key_id: row.wrapping_key_id.clone(),
                logical_key_name: row.logical_key_name.clone(),
                wrapping_key_name: row.wrapping_key_name.clone(),
                wrapping_key_version: row.wrapping_key_version.clone(),
                wrapped_key: row.wrapped_key.clone(),
                initialization_vector: row.initialization_vector.clone(),
                is_disabled: true,
            },
            &h.ct,
        )
        .await
        .unwrap()
        .unwrap();

    // Drop the still-cached unwrapped material so the resolve reads the
    // (now disabled) record.
    h.cache
        .delete(&h.engine.unwrapped_cache_key(&logical.id))
        .await
        .unwrap();

    let err = h.engine.encrypt(logical.id, b"x", &h.ct).await.unwrap_err();
    assert!(matches!(err, EncryptionError::KeyNotFound(found) if found == logical.id));
}
