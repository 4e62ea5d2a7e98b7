//! [`KeyRecordStore`]: the relational record store for key wrappings.
//!
//! One table, composite primary key `(logical_key_id, wrapping_key_id)`.
//! A logical key has one row per wrapping-key version it has ever been
//! wrapped under; the non-deleted row with the greatest `created_at` is the
//! active wrapping. Byte columns are persisted as base64 text, timestamps as
//! UTC microsecond integers.
//!
//! Mutations commit inside a transaction; the cache write is a separate step
//! after a successful commit (`register`/`update`) or before the relational
//! mutation (`remove`, eviction-first so stale wrapped material is never
//! served while a delete is in flight).

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::cache::{ByteCache, CacheNamespace};
use common::ensure_active;
use common::error::EncryptionError;
use common::keys::{KeyRecord, LogicalKeyId};
use common::options::CacheOptions;

/// Cache namespace prefix for wrapped key records.
const KEY_RECORD_PREFIX: &str = "DbKeyRecord";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS key_records (
    logical_key_id        TEXT    NOT NULL,
    wrapping_key_id       TEXT    NOT NULL,
    logical_key_name      TEXT    NOT NULL,
    wrapping_key_name     TEXT    NOT NULL,
    wrapping_key_version  TEXT    NOT NULL,
    wrapped_key           TEXT    NOT NULL,
    initialization_vector TEXT    NOT NULL,
    created_at            INTEGER NOT NULL,
    modified_at           INTEGER NOT NULL,
    is_disabled           INTEGER NOT NULL DEFAULT 0,
    is_deleted            INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (logical_key_id, wrapping_key_id)
);
";

const COLUMNS: &str = "logical_key_id, wrapping_key_id, logical_key_name, wrapping_key_name, \
     wrapping_key_version, wrapped_key, initialization_vector, created_at, modified_at, \
     is_disabled, is_deleted";

/// Fields supplied when registering a new wrapping row. Timestamps are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewKeyRecord {
    pub logical_key_id: LogicalKeyId,
    pub wrapping_key_id: String,
    pub logical_key_name: String,
    pub wrapping_key_name: String,
    pub wrapping_key_version: String,
    pub wrapped_key: Vec<u8>,
    pub initialization_vector: Vec<u8>,
}

/// Field updates applied to the unique non-deleted row matching
/// `(logical_key_id, wrapping_key_id)`.
#[derive(Debug, Clone)]
pub struct UpdateKeyRecord {
    pub logical_key_id: LogicalKeyId,
    pub wrapping_key_id: String,
    pub logical_key_name: String,
    pub wrapping_key_name: String,
    pub wrapping_key_version: String,
    pub wrapped_key: Vec<u8>,
    pub initialization_vector: Vec<u8>,
    pub is_disabled: bool,
}

/// Relational store for [`KeyRecord`] rows with cache-aside reads.
pub struct KeyRecordStore {
    conn: Mutex<Connection>,
    cache: CacheNamespace,
}

impl KeyRecordStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Storage`] if the database cannot be opened
    /// or the schema cannot be applied.
    pub fn open(
        path: impl AsRef<Path>,
        cache: Arc<dyn ByteCache>,
        options: &CacheOptions,
    ) -> Result<Self, EncryptionError> {
        let conn = Connection::open(path)
            .map_err(|e| EncryptionError::Storage(format!("failed to open database: {e}")))?;
        Self::init(conn, cache, options)
    }

    /// Open an in-memory store; used by tests and ephemeral hosts.
    pub fn open_in_memory(
        cache: Arc<dyn ByteCache>,
        options: &CacheOptions,
    ) -> Result<Self, EncryptionError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EncryptionError::Storage(format!("failed to open database: {e}")))?;
        Self::init(conn, cache, options)
    }

    fn init(
        conn: Connection,
        cache: Arc<dyn ByteCache>,
        options: &CacheOptions,
    ) -> Result<Self, EncryptionError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| EncryptionError::Storage(format!("failed to apply schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: CacheNamespace::new(cache, KEY_RECORD_PREFIX, options.ttl()),
        })
    }

    /// The cache key under which records for `id` are stored.
    pub fn cache_key(&self, id: &LogicalKeyId) -> String {
        self.cache.cache_key(id)
    }

    /// Insert a new wrapping row, assigning `created_at = modified_at = now`,
    /// then write-through cache it keyed by logical id.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Validation`] before any I/O on malformed input;
    /// [`EncryptionError::Storage`] if the insert fails (the transaction is
    /// rolled back); [`EncryptionError::Cache`] if the write-through fails.
    pub async fn register(
        &self,
        new: NewKeyRecord,
        ct: &CancellationToken,
    ) -> Result<KeyRecord, EncryptionError> {
        validate_name(&new.wrapping_key_id, "wrapping_key_id")?;
        validate_name(&new.logical_key_name, "logical_key_name")?;
        validate_name(&new.wrapping_key_name, "wrapping_key_name")?;
        validate_name(&new.wrapping_key_version, "wrapping_key_version")?;
        validate_bytes(&new.wrapped_key, "wrapped_key")?;
        validate_bytes(&new.initialization_vector, "initialization_vector")?;

        let now = Utc::now();
        let record = KeyRecord {
            logical_key_id: new.logical_key_id,
            wrapping_key_id: new.wrapping_key_id,
            logical_key_name: new.logical_key_name,
            wrapping_key_name: new.wrapping_key_name,
            wrapping_key_version: new.wrapping_key_version,
            wrapped_key: new.wrapped_key,
            initialization_vector: new.initialization_vector,
            created_at: now,
            modified_at: now,
            is_disabled: false,
            is_deleted: false,
        };

        info!(
            logical_key_id = %record.logical_key_id,
            wrapping_key_id = %record.wrapping_key_id,
            "registering key record"
        );

        ensure_active(ct)?;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("failed to begin transaction", e))?;
            tx.execute(
                &format!("INSERT INTO key_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    record.logical_key_id.to_string(),
                    record.wrapping_key_id,
                    record.logical_key_name,
                    record.wrapping_key_name,
                    record.wrapping_key_version,
                    STANDARD.encode(&record.wrapped_key),
                    STANDARD.encode(&record.initialization_vector),
                    record.created_at.timestamp_micros(),
                    record.modified_at.timestamp_micros(),
                    record.is_disabled,
                    record.is_deleted,
                ],
            )
            .map_err(|e| storage_err("failed to insert key record", e))?;
            tx.commit()
                .map_err(|e| storage_err("failed to commit key record insert", e))?;
        }

        ensure_active(ct)?;
        self.cache.set(&record.logical_key_id, &record).await?;

        Ok(record)
    }

    /// Apply field updates to the unique non-deleted row matching the
    /// update's `(logical_key_id, wrapping_key_id)`, bumping `modified_at`.
    ///
    /// Returns `None` (not an error) when no matching row exists.
    pub async fn update(
        &self,
        update: UpdateKeyRecord,
        ct: &CancellationToken,
    ) -> Result<Option<KeyRecord>, EncryptionError> {
        validate_name(&update.wrapping_key_id, "wrapping_key_id")?;
        validate_name(&update.logical_key_name, "logical_key_name")?;
        validate_name(&update.wrapping_key_name, "wrapping_key_name")?;
        validate_name(&update.wrapping_key_version, "wrapping_key_version")?;
        validate_bytes(&update.wrapped_key, "wrapped_key")?;
        validate_bytes(&update.initialization_vector, "initialization_vector")?;

        ensure_active(ct)?;
        let record = {
            let mut conn = self.conn.lock().await;
            let Some(existing) =
                query_one(&conn, update.logical_key_id, &update.wrapping_key_id)?
            else {
                warn!(
                    logical_key_id = %update.logical_key_id,
                    wrapping_key_id = %update.wrapping_key_id,
                    "no key record to update"
                );
                return Ok(None);
            };

            let now = Utc::now();
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("failed to begin transaction", e))?;
            tx.execute(
                "UPDATE key_records
                 SET logical_key_name = ?1, wrapping_key_name = ?2, wrapping_key_version = ?3,
                     wrapped_key = ?4, initialization_vector = ?5, is_disabled = ?6,
                     modified_at = ?7
                 WHERE is_deleted = 0 AND logical_key_id = ?8 AND wrapping_key_id = ?9",
                params![
                    update.logical_key_name,
                    update.wrapping_key_name,
                    update.wrapping_key_version,
                    STANDARD.encode(&update.wrapped_key),
                    STANDARD.encode(&update.initialization_vector),
                    update.is_disabled,
                    now.timestamp_micros(),
                    update.logical_key_id.to_string(),
                    update.wrapping_key_id,
                ],
            )
            .map_err(|e| storage_err("failed to update key record", e))?;
            tx.commit()
                .map_err(|e| storage_err("failed to commit key record update", e))?;

            KeyRecord {
                logical_key_id: update.logical_key_id,
                wrapping_key_id: update.wrapping_key_id,
                logical_key_name: update.logical_key_name,
                wrapping_key_name: update.wrapping_key_name,
                wrapping_key_version: update.wrapping_key_version,
                wrapped_key: update.wrapped_key,
                initialization_vector: update.initialization_vector,
                created_at: existing.created_at,
                modified_at: now,
                is_disabled: update.is_disabled,
                is_deleted: false,
            }
        };

        info!(
            logical_key_id = %record.logical_key_id,
            wrapping_key_id = %record.wrapping_key_id,
            is_disabled = record.is_disabled,
            "updated key record"
        );

        ensure_active(ct)?;
        self.cache.set(&record.logical_key_id, &record).await?;

        Ok(Some(record))
    }

    /// Cache-aside read of the unique non-deleted row matching
    /// `(logical_key_id, wrapping_key_id)`, populating the cache on a miss.
    pub async fn view(
        &self,
        logical_key_id: LogicalKeyId,
        wrapping_key_id: &str,
        ct: &CancellationToken,
    ) -> Result<Option<KeyRecord>, EncryptionError> {
        validate_name(wrapping_key_id, "wrapping_key_id")?;
        ensure_active(ct)?;

        self.cache
            .read_through(&logical_key_id, || async move {
                let conn = self.conn.lock().await;
                query_one(&conn, logical_key_id, wrapping_key_id)
            })
            .await
    }

    /// Cache-aside read of the active wrapping for `logical_key_id`: the
    /// non-deleted row with the greatest `created_at`, insertion order
    /// breaking timestamp ties. Shares the cache slot with
    /// [`view`](Self::view).
    pub async fn view_latest(
        &self,
        logical_key_id: LogicalKeyId,
        ct: &CancellationToken,
    ) -> Result<Option<KeyRecord>, EncryptionError> {
        ensure_active(ct)?;

        self.cache
            .read_through(&logical_key_id, || async move {
                let conn = self.conn.lock().await;
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM key_records
                         WHERE is_deleted = 0 AND logical_key_id = ?1
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT 1"
                    ),
                    params![logical_key_id.to_string()],
                    record_from_row,
                )
                .optional()
                .map_err(|e| storage_err("failed to query latest key record", e))
            })
            .await
    }

    /// Soft-delete the row matching `(logical_key_id, wrapping_key_id)`.
    ///
    /// The cache entry is evicted **before** the store is touched. Returns
    /// `false` when no matching non-deleted row exists.
    pub async fn remove(
        &self,
        logical_key_id: LogicalKeyId,
        wrapping_key_id: &str,
        ct: &CancellationToken,
    ) -> Result<bool, EncryptionError> {
        validate_name(wrapping_key_id, "wrapping_key_id")?;

        ensure_active(ct)?;
        self.cache.delete(&logical_key_id).await?;

        ensure_active(ct)?;
        let mut conn = self.conn.lock().await;
        if query_one(&conn, logical_key_id, wrapping_key_id)?.is_none() {
            warn!(
                %logical_key_id,
                wrapping_key_id,
                "no key record to remove"
            );
            return Ok(false);
        }

        let tx = conn
            .transaction()
            .map_err(|e| storage_err("failed to begin transaction", e))?;
        tx.execute(
            "UPDATE key_records SET is_deleted = 1, modified_at = ?1
             WHERE is_deleted = 0 AND logical_key_id = ?2 AND wrapping_key_id = ?3",
            params![
                Utc::now().timestamp_micros(),
                logical_key_id.to_string(),
                wrapping_key_id,
            ],
        )
        .map_err(|e| storage_err("failed to soft-delete key record", e))?;
        tx.commit()
            .map_err(|e| storage_err("failed to commit key record delete", e))?;

        info!(%logical_key_id, wrapping_key_id, "soft-deleted key record");
        Ok(true)
    }
}

fn query_one(
    conn: &Connection,
    logical_key_id: LogicalKeyId,
    wrapping_key_id: &str,
) -> Result<Option<KeyRecord>, EncryptionError> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM key_records
             WHERE is_deleted = 0 AND logical_key_id = ?1 AND wrapping_key_id = ?2"
        ),
        params![logical_key_id.to_string(), wrapping_key_id],
        record_from_row,
    )
    .optional()
    .map_err(|e| storage_err("failed to query key record", e))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRecord> {
    let logical: String = row.get(0)?;
    let wrapped_b64: String = row.get(5)?;
    let iv_b64: String = row.get(6)?;
    let created_micros: i64 = row.get(7)?;
    let modified_micros: i64 = row.get(8)?;

    Ok(KeyRecord {
        logical_key_id: Uuid::parse_str(&logical)
            .map(LogicalKeyId::from)
            .map_err(|e| conversion_err(0, e))?,
        wrapping_key_id: row.get(1)?,
        logical_key_name: row.get(2)?,
        wrapping_key_name: row.get(3)?,
        wrapping_key_version: row.get(4)?,
        wrapped_key: STANDARD
            .decode(wrapped_b64.as_bytes())
            .map_err(|e| conversion_err(5, e))?,
        initialization_vector: STANDARD
            .decode(iv_b64.as_bytes())
            .map_err(|e| conversion_err(6, e))?,
        created_at: timestamp_from_micros(7, created_micros)?,
        modified_at: timestamp_from_micros(8, modified_micros)?,
        is_disabled: row.get(9)?,
        is_deleted: row.get(10)?,
    })
}

fn timestamp_from_micros(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn storage_err(context: &str, e: rusqlite::Error) -> EncryptionError {
    error!(error = %e, context, "storage operation failed");
    EncryptionError::Storage(format!("{context}: {e}"))
}

fn validate_name(value: &str, field: &str) -> Result<(), EncryptionError> {
    if value.trim().is_empty() {
        return Err(EncryptionError::Validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn validate_bytes(value: &[u8], field: &str) -> Result<(), EncryptionError> {
    if value.is_empty() {
        return Err(EncryptionError::Validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}
