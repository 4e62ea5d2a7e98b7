//! [`MemoryKeyVault`]: an in-process key-custody service.
//!
//! Implements the vault contract with 2048-bit RSA-OAEP (SHA-256) wrapping,
//! keyed by `{name}/{version}`. Used by tests and hosts without an external
//! HSM/KMS; production deployments adapt their vendor SDK to the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use common::error::EncryptionError;
use common::keys::WrappingKeyDefinition;
use common::vault::AsymmetricKeyVault;

const RSA_BITS: usize = 2048;

struct VaultEntry {
    definition: WrappingKeyDefinition,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

/// In-process [`AsymmetricKeyVault`] holding RSA key pairs in memory.
#[derive(Clone, Default)]
pub struct MemoryKeyVault {
    keys: Arc<RwLock<HashMap<String, VaultEntry>>>,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key_id(name: &str, version: &str) -> String {
    format!("{name}/{version}")
}

fn not_present(name: &str, version: &str) -> EncryptionError {
    EncryptionError::Vault(format!("wrapping key {name}/{version} not present"))
}

#[async_trait]
impl AsymmetricKeyVault for MemoryKeyVault {
    async fn create_key(&self, name: &str) -> Result<WrappingKeyDefinition, EncryptionError> {
        if name.trim().is_empty() {
            return Err(EncryptionError::Validation(
                "wrapping key name must not be empty".into(),
            ));
        }

        // A fresh version every time; creating under an existing name is a
        // new version, not an error.
        let version = Uuid::new_v4().to_string();
        let id = key_id(name, &version);

        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| EncryptionError::Vault(format!("RSA key generation failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        let definition = WrappingKeyDefinition {
            id: id.clone(),
            name: name.to_owned(),
            version,
            is_enabled: true,
            created_at: Utc::now(),
        };

        info!(key_id = %id, "created wrapping key version");

        self.keys.write().await.insert(
            id,
            VaultEntry {
                definition: definition.clone(),
                private_key,
                public_key,
            },
        );

        Ok(definition)
    }

    async fn disable_key(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError> {
        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(&key_id(name, version))
            .ok_or_else(|| not_present(name, version))?;
        entry.definition.is_enabled = false;
        info!(key_id = %entry.definition.id, "disabled wrapping key version");
        Ok(entry.definition.clone())
    }

    async fn enable_key(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError> {
        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(&key_id(name, version))
            .ok_or_else(|| not_present(name, version))?;
        entry.definition.is_enabled = true;
        Ok(entry.definition.clone())
    }

    async fn remove_key(
        &self,
        name: &str,
        _await_completion: bool,
    ) -> Result<bool, EncryptionError> {
        let mut keys = self.keys.write().await;
        let prefix = format!("{name}/");
        let ids: Vec<String> = keys
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(EncryptionError::Vault(format!(
                "no versions of wrapping key {name} present"
            )));
        }
        for id in ids {
            keys.remove(&id);
        }
        info!(name, "removed all wrapping key versions");
        Ok(true)
    }

    async fn wrap_key(
        &self,
        name: &str,
        version: &str,
        raw_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let keys = self.keys.read().await;
        let entry = keys
            .get(&key_id(name, version))
            .ok_or_else(|| not_present(name, version))?;
        if !entry.definition.is_enabled {
            return Err(EncryptionError::Vault(format!(
                "wrapping key {name}/{version} is disabled"
            )));
        }
        entry
            .public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), raw_key)
            .map_err(|e| EncryptionError::Vault(format!("wrap failed: {e}")))
    }

    async fn unwrap_key(
        &self,
        name: &str,
        version: &str,
        wrapped_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let keys = self.keys.read().await;
        let entry = keys
            .get(&key_id(name, version))
            .ok_or_else(|| not_present(name, version))?;
        if !entry.definition.is_enabled {
            return Err(EncryptionError::Vault(format!(
                "wrapping key {name}/{version} is disabled"
            )));
        }
        entry
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped_key)
            .map_err(|e| EncryptionError::Vault(format!("unwrap failed: {e}")))
    }

    async fn view_key_definition(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError> {
        let keys = self.keys.read().await;
        keys.get(&key_id(name, version))
            .map(|entry| entry.definition.clone())
            .ok_or_else(|| not_present(name, version))
    }
}
