//! Key identifiers, records, and definition summaries.
//!
//! A logical key (DEK) keeps one stable [`LogicalKeyId`] across its whole
//! rotation history; each wrapping under a key-encryption-key version is a
//! separate [`KeyRecord`] row keyed by `(logical_key_id, wrapping_key_id)`.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Byte length of the symmetric data-encryption key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of the cipher initialization vector (16 bytes = 128 bits).
pub const IV_LEN: usize = 16;

/// Stable 128-bit identity of a logical data-encryption key.
///
/// Never changes across rotation; only the wrapping changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalKeyId(Uuid);

impl LogicalKeyId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The flattened (hyphen-free, lowercase) form used in cache keys.
    pub fn flat(&self) -> String {
        self.0.simple().to_string()
    }
}

impl From<Uuid> for LogicalKeyId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for LogicalKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Serde helpers for byte fields persisted and cached as base64 text.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Plaintext DEK bytes.
///
/// The buffer is overwritten with zeroes on drop and never printed, to keep
/// the window during which key material lives in readable memory small. It
/// still serialises (as base64) because unwrapped material is cached in the
/// distributed cache by design.
#[derive(Clone, PartialEq, Eq)]
pub struct RawKeyBytes(Vec<u8>);

impl RawKeyBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for RawKeyBytes {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for RawKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material — not even in debug builds.
        f.write_str("RawKeyBytes([REDACTED])")
    }
}

impl Serialize for RawKeyBytes {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for RawKeyBytes {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map(RawKeyBytes)
            .map_err(serde::de::Error::custom)
    }
}

/// One persisted wrapping of a logical key, owned by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub logical_key_id: LogicalKeyId,
    /// Unique per wrapping-key version; composite primary key with the
    /// logical id.
    pub wrapping_key_id: String,
    pub logical_key_name: String,
    pub wrapping_key_name: String,
    pub wrapping_key_version: String,
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub initialization_vector: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Logically retired wrapping: readable for audit, unusable for new
    /// operations.
    pub is_disabled: bool,
    /// Soft-delete marker; excluded from every read once set.
    pub is_deleted: bool,
}

/// Transient cache-only aggregate holding the plaintext DEK alongside its
/// current wrapping. Never written to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwrappedKeyMaterial {
    pub logical_key_id: LogicalKeyId,
    pub logical_key_name: String,
    pub wrapping_key_id: String,
    pub wrapping_key_name: String,
    pub wrapping_key_version: String,
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    pub raw_key: RawKeyBytes,
    #[serde(with = "base64_bytes")]
    pub initialization_vector: Vec<u8>,
}

/// Summary view of a logical key, as returned to engine callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalKeyDefinition {
    pub id: LogicalKeyId,
    pub name: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Summary view of one wrapping-key version, as reported by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappingKeyDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_id_has_no_hyphens() {
        let id = LogicalKeyId::generate();
        let flat = id.flat();
        assert_eq!(flat.len(), 32);
        assert!(!flat.contains('-'));
    }

    #[test]
    fn raw_key_bytes_redacted_in_debug() {
        let raw = RawKeyBytes::new(vec![0xFF; KEY_LEN]);
        assert!(format!("{raw:?}").contains("REDACTED"));
    }

    #[test]
    fn raw_key_bytes_serde_round_trip() {
        let raw = RawKeyBytes::new(vec![0x42; KEY_LEN]);
        let json = serde_json::to_string(&raw).unwrap();
        let decoded: RawKeyBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn unwrapped_material_survives_cache_serialisation() {
        let material = UnwrappedKeyMaterial {
            logical_key_id: LogicalKeyId::generate(),
            logical_key_name: "orders-dek".into(),
            wrapping_key_id: "orders-kek/v1".into(),
            wrapping_key_name: "orders-kek".into(),
            wrapping_key_version: "v1".into(),
            wrapped_key: vec![1, 2, 3],
            raw_key: RawKeyBytes::new(vec![9; KEY_LEN]),
            initialization_vector: vec![7; IV_LEN],
        };
        let bytes = serde_json::to_vec(&material).unwrap();
        let decoded: UnwrappedKeyMaterial = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, material);
    }
}
