//! Key/value store seam and the bundled in-memory implementation.
//!
//! The engine only needs namespaced `get`/`set`/`delete`. Production deployments
//! put a shared cache service behind [`Store`]; [`MemoryStore`] keeps everything
//! in-process with LRU eviction.

use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("failed to encode cached value: {0}")]
    Encode(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// External key/value collaborator addressed by `(group, key)`.
///
/// Implementations are not required to offer read-your-writes across nodes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, group: &str, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(
        &self,
        group: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, group: &str, key: &str) -> Result<(), StoreError>;
}

/// Bound a store call by `after`, mapping elapsed deadlines to [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after }),
    }
}

#[derive(Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-process LRU store honoring per-key TTLs.
pub struct MemoryStore {
    values: RwLock<LruCache<(String, String), StoredValue>>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            values: RwLock::new(LruCache::new(config.store_capacity_non_zero())),
        }
    }

    /// Number of resident values, including ones whose TTL lapsed but were not read since.
    pub fn len(&self) -> usize {
        rw_read(&self.values, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.values, SOURCE, "clear").clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, group: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
        let slot = (group.to_string(), key.to_string());
        let mut values = rw_write(&self.values, SOURCE, "get");

        let live = match values.get(&slot) {
            Some(stored) if stored.is_live(Instant::now()) => Some(stored.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if live.is_none() {
            values.pop(&slot);
        }
        Ok(live)
    }

    async fn set(
        &self,
        group: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let stored = StoredValue {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        rw_write(&self.values, SOURCE, "set").put((group.to_string(), key.to_string()), stored);
        Ok(())
    }

    async fn delete(&self, group: &str, key: &str) -> Result<(), StoreError> {
        rw_write(&self.values, SOURCE, "delete").pop(&(group.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn groups_are_isolated() {
        let store = MemoryStore::default();
        store
            .set("pages", "k", Bytes::from_static(b"page"), None)
            .await
            .expect("set");

        assert_eq!(
            store.get("pages", "k").await.expect("get"),
            Some(Bytes::from_static(b"page"))
        );
        assert_eq!(store.get("records", "k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_values_read_as_absent() {
        let store = MemoryStore::default();
        store
            .set("pages", "k", Bytes::from_static(b"v"), Some(Duration::ZERO))
            .await
            .expect("set");

        assert_eq!(store.get("pages", "k").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_value() {
        let store = MemoryStore::default();
        store
            .set("pages", "k", Bytes::from_static(b"v"), None)
            .await
            .expect("set");
        store.delete("pages", "k").await.expect("delete");
        assert_eq!(store.get("pages", "k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn lru_evicts_oldest_value() {
        let config = CacheConfig {
            store_capacity: 2,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);
        for key in ["a", "b", "c"] {
            store
                .set("pages", key, Bytes::from(key.to_string()), None)
                .await
                .expect("set");
        }

        assert_eq!(store.get("pages", "a").await.expect("get"), None);
        assert!(store.get("pages", "c").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn bounded_maps_elapsed_deadline_to_timeout() {
        let result: Result<(), StoreError> = bounded("get", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout { op: "get", .. })));
    }
}
