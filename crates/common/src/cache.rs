//! Distributed cache capability and the shared read-through namespace.
//!
//! Both the record store (wrapped material) and the engine (unwrapped
//! material) follow the same cache-aside shape; [`CacheNamespace`] is the
//! single implementation of that shape, parameterised by prefix, TTL, and a
//! loader. Cache failures abort the enclosing operation — the cache is a
//! dependency here, not a best-effort accelerator.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::EncryptionError;
use crate::keys::LogicalKeyId;

/// Byte-oriented distributed cache: `set` with absolute TTL, `get`, `delete`.
#[async_trait]
pub trait ByteCache: Send + Sync {
    /// Store `value` under `key`, expiring `ttl` after the write (absolute,
    /// not sliding).
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), EncryptionError>;

    /// Fetch the value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EncryptionError>;

    /// Remove the value under `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), EncryptionError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process [`ByteCache`] with absolute expiration.
///
/// Suitable for tests and single-process hosts; multi-process deployments
/// substitute a real distributed cache behind the same trait.
#[derive(Clone, Default)]
pub struct MemoryCache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ByteCache for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), EncryptionError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.write().await.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EncryptionError> {
        {
            let guard = self.inner.read().await;
            match guard.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
            }
        }
        // Expired: evict under the write lock, re-checking in case a newer
        // write raced the upgrade.
        let mut guard = self.inner.write().await;
        if guard
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), EncryptionError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// A fixed prefix and TTL over a shared [`ByteCache`], with typed JSON
/// entries keyed by flattened [`LogicalKeyId`].
#[derive(Clone)]
pub struct CacheNamespace {
    cache: Arc<dyn ByteCache>,
    prefix: &'static str,
    ttl: Duration,
}

impl CacheNamespace {
    pub fn new(cache: Arc<dyn ByteCache>, prefix: &'static str, ttl: Duration) -> Self {
        Self { cache, prefix, ttl }
    }

    /// The full cache key for a logical key id: `{prefix}_{flat-id}`.
    pub fn cache_key(&self, id: &LogicalKeyId) -> String {
        format!("{}_{}", self.prefix, id.flat())
    }

    /// Fetch and decode the cached entry for `id`, if present.
    pub async fn get<T: DeserializeOwned>(
        &self,
        id: &LogicalKeyId,
    ) -> Result<Option<T>, EncryptionError> {
        let key = self.cache_key(id);
        let Some(bytes) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EncryptionError::Cache(format!("corrupt cache entry {key}: {e}")))
    }

    /// Encode and store `value` for `id` under this namespace's TTL.
    pub async fn set<T: Serialize>(
        &self,
        id: &LogicalKeyId,
        value: &T,
    ) -> Result<(), EncryptionError> {
        let key = self.cache_key(id);
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EncryptionError::Cache(format!("failed to encode cache entry: {e}")))?;
        self.cache.set(&key, bytes, self.ttl).await
    }

    /// Evict the entry for `id`.
    pub async fn delete(&self, id: &LogicalKeyId) -> Result<(), EncryptionError> {
        self.cache.delete(&self.cache_key(id)).await
    }

    /// Cache-aside read: return the cached entry for `id` if present,
    /// otherwise run `loader` and populate the cache with its result before
    /// returning it. A `None` from the loader is returned as-is and not
    /// cached.
    pub async fn read_through<T, F, Fut>(
        &self,
        id: &LogicalKeyId,
        loader: F,
    ) -> Result<Option<T>, EncryptionError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, EncryptionError>>,
    {
        if let Some(hit) = self.get(id).await? {
            debug!(prefix = self.prefix, %id, "cache hit");
            return Ok(Some(hit));
        }
        debug!(prefix = self.prefix, %id, "cache miss");
        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.set(id, value).await?;
        }
        Ok(loaded)
    }
}

impl fmt::Debug for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheNamespace")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(ttl: Duration) -> CacheNamespace {
        CacheNamespace::new(Arc::new(MemoryCache::new()), "TestEntry", ttl)
    }

    #[tokio::test]
    async fn set_get_delete() {
        let ns = namespace(Duration::from_secs(60));
        let id = LogicalKeyId::generate();
        ns.set(&id, &"hello".to_owned()).await.unwrap();
        let got: Option<String> = ns.get(&id).await.unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
        ns.delete(&id).await.unwrap();
        let gone: Option<String> = ns.get(&id).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn entries_expire_absolutely() {
        let ns = namespace(Duration::from_millis(20));
        let id = LogicalKeyId::generate();
        ns.set(&id, &7u32).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let got: Option<u32> = ns.get(&id).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_read() {
        let cache = MemoryCache::new();
        cache
            .set("k", vec![1], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn read_through_populates_on_miss() {
        let ns = namespace(Duration::from_secs(60));
        let id = LogicalKeyId::generate();

        let loaded = ns
            .read_through(&id, || async { Ok(Some(41u32)) })
            .await
            .unwrap();
        assert_eq!(loaded, Some(41));

        // Second read must be served from the cache, not the loader.
        let cached = ns
            .read_through(&id, || async {
                panic!("loader must not run on a cache hit")
            })
            .await
            .unwrap();
        assert_eq!(cached, Some(41u32));
    }

    #[tokio::test]
    async fn read_through_does_not_cache_absent() {
        let ns = namespace(Duration::from_secs(60));
        let id = LogicalKeyId::generate();

        let missing: Option<u32> = ns.read_through(&id, || async { Ok(None) }).await.unwrap();
        assert!(missing.is_none());

        // The loader runs again because nothing was cached.
        let loaded = ns
            .read_through(&id, || async { Ok(Some(5u32)) })
            .await
            .unwrap();
        assert_eq!(loaded, Some(5));
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let cache: Arc<dyn ByteCache> = Arc::new(MemoryCache::new());
        let a = CacheNamespace::new(cache.clone(), "PrefixA", Duration::from_secs(60));
        let b = CacheNamespace::new(cache, "PrefixB", Duration::from_secs(60));
        let id = LogicalKeyId::generate();
        a.set(&id, &1u32).await.unwrap();
        let other: Option<u32> = b.get(&id).await.unwrap();
        assert!(other.is_none());
    }
}
