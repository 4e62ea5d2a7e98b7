//! Contracts, data types, and errors shared across the envelope key management crates.

pub mod cache;
pub mod cipher;
pub mod error;
pub mod keys;
pub mod options;
pub mod vault;

pub use error::{ensure_active, EncryptionError};
