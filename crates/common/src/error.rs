//! Error taxonomy shared across crates.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::keys::LogicalKeyId;

/// Top-level error type for key management operations.
///
/// "Absent" is deliberately not part of this taxonomy: record store reads
/// return `Option<KeyRecord>` and removal returns `bool`, so callers can
/// distinguish a missing key from a broken dependency.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The request was malformed — empty name, wrong key length, empty payload.
    /// Raised before any I/O and never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No active key material exists for the logical key, in an operation
    /// that must produce definitions or a payload transform.
    #[error("logical key {0} not found")]
    KeyNotFound(LogicalKeyId),

    /// The key-custody service rejected an operation: disabled key, unknown
    /// name/version, or a service fault.
    #[error("vault operation failed: {0}")]
    Vault(String),

    /// A relational commit failed. The enclosing transaction has been rolled
    /// back before this error is surfaced.
    #[error("storage operation failed: {0}")]
    Storage(String),

    /// A distributed-cache operation failed. Cache failures abort the
    /// enclosing operation; the cache is not treated as best-effort.
    #[error("cache operation failed: {0}")]
    Cache(String),

    /// The symmetric cipher rejected its inputs or failed to transform.
    #[error("cipher operation failed: {0}")]
    Cipher(String),

    /// The caller's cancellation token fired at an I/O boundary.
    #[error("operation cancelled")]
    Cancelled,
}

/// Fail fast with [`EncryptionError::Cancelled`] if the token has fired.
///
/// Called at every I/O boundary (cache, store, vault). Cancellation aborts
/// the current step only; steps already committed are not compensated.
pub fn ensure_active(ct: &CancellationToken) -> Result<(), EncryptionError> {
    if ct.is_cancelled() {
        Err(EncryptionError::Cancelled)
    } else {
        Ok(())
    }
}
