//! Envelope key management: a symmetric data-encryption key (DEK) is wrapped
//! by a rotating asymmetric key-encryption key (KEK) held in an external
//! vault, and only the wrapped form is persisted.
//!
//! # Lifecycle
//!
//! 1. [`KeyManagementEngine::create_keys`] generates a fresh DEK + IV, has
//!    the vault create and wrap under a named KEK, persists the wrapping,
//!    and caches the unwrapped material.
//! 2. Encrypt/decrypt resolve the active unwrapped material (cache, else
//!    record store + vault unwrap) and dispatch to the cipher.
//! 3. [`KeyManagementEngine::rotate_wrapping_key`] re-wraps the *same* DEK
//!    under a new KEK version and retires the old one — a forward-only saga
//!    across vault, record store, and cache with no cross-store transaction.
//!
//! # Security invariants
//!
//! - The plaintext DEK is never written to the record store, logged, or
//!   printed; it lives only in the unwrapped-material cache namespace.
//! - A disabled KEK version never wraps or unwraps again.

pub mod cipher;
pub mod context;
pub mod engine;
pub mod vault;

pub use cipher::AesCbcCipher;
pub use context::EncryptionContext;
pub use engine::KeyManagementEngine;
pub use vault::MemoryKeyVault;
