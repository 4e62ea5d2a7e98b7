//! The asymmetric key-custody capability consumed by the engine.

use async_trait::async_trait;

use crate::error::EncryptionError;
use crate::keys::WrappingKeyDefinition;

/// Operation contract of the external key-custody service.
///
/// The service holds named, versioned asymmetric keys used only to wrap and
/// unwrap DEK bytes. Vendor internals (HSM/KMS semantics, wire protocol) are
/// out of scope; implementations adapt a vendor SDK to this trait.
#[async_trait]
pub trait AsymmetricKeyVault: Send + Sync {
    /// Create a wrapping key under `name`. Creating under an existing name
    /// yields a new version, not an error.
    async fn create_key(&self, name: &str) -> Result<WrappingKeyDefinition, EncryptionError>;

    /// Disable one version. A disabled version must refuse wrap and unwrap
    /// from that point on.
    async fn disable_key(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError>;

    /// Re-enable one version.
    async fn enable_key(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError>;

    /// Remove every version under `name`. Fails if none exist. A version is
    /// intentionally not required for removal-by-name.
    async fn remove_key(&self, name: &str, await_completion: bool)
        -> Result<bool, EncryptionError>;

    /// Wrap raw DEK bytes under `(name, version)`. Fails if the version is
    /// disabled or absent.
    async fn wrap_key(
        &self,
        name: &str,
        version: &str,
        raw_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;

    /// Unwrap previously wrapped DEK bytes. Fails if the version is disabled
    /// or absent.
    async fn unwrap_key(
        &self,
        name: &str,
        version: &str,
        wrapped_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;

    /// Fetch the definition of one version.
    async fn view_key_definition(
        &self,
        name: &str,
        version: &str,
    ) -> Result<WrappingKeyDefinition, EncryptionError>;
}
