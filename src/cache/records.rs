//! Per-URL origin records and variant bookkeeping.
//!
//! Every variant stored for a URL is listed in its [`OriginRecord`], so a full
//! invalidation deletes exactly those entries without scanning the store.
//! Entry writes and record updates for one URL share a per-key lock, so an
//! invalidation never interleaves with a write in-process; across processes
//! the record is eventually consistent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::OriginRecord;
use super::keys::entry_key;
use super::store::{Store, StoreError, bounded};

const TOUCH_ATTEMPTS: usize = 3;

/// What an invalidation removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub entries_deleted: usize,
    pub record_removed: bool,
}

pub struct RecordBook {
    store: Arc<dyn Store>,
    entry_group: String,
    record_group: String,
    timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecordBook {
    pub fn new(store: Arc<dyn Store>, config: &CacheConfig) -> Self {
        Self {
            store,
            entry_group: config.group.clone(),
            record_group: config.record_group.clone(),
            timeout: config.store_timeout(),
            locks: DashMap::new(),
        }
    }

    /// Read a record; an undecodable one is treated as absent.
    pub async fn load(&self, cache_key: &str) -> Result<Option<OriginRecord>, StoreError> {
        let raw = bounded(
            "record_get",
            self.timeout,
            self.store.get(&self.record_group, cache_key),
        )
        .await?;

        Ok(raw.and_then(|raw| match OriginRecord::from_bytes(&raw) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(cache_key, error = %error, "discarding malformed origin record");
                None
            }
        }))
    }

    pub async fn load_or_default(&self, cache_key: &str) -> Result<OriginRecord, StoreError> {
        Ok(self
            .load(cache_key)
            .await?
            .unwrap_or_else(|| OriginRecord::new(cache_key)))
    }

    /// Make sure `variant_key` is listed for `cache_key`.
    ///
    /// Returns `true` when the variant was newly recorded. Each write is read
    /// back and retried if another writer replaced it without the variant.
    pub async fn touch(&self, cache_key: &str, variant_key: &str) -> Result<bool, StoreError> {
        let _guard = self.lock(cache_key).await;
        self.touch_locked(cache_key, variant_key).await
    }

    /// List `variant_key` and write its entry under the record lock.
    pub async fn store_entry(
        &self,
        cache_key: &str,
        variant_key: &str,
        raw: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(cache_key).await;
        self.touch_locked(cache_key, variant_key).await?;
        self.set_entry(&entry_key(cache_key, variant_key), raw, ttl).await
    }

    /// Overwrite a stored entry under the record lock.
    ///
    /// Returns `false` without writing when the entry is gone, so an entry
    /// invalidated since it was read is not brought back.
    pub async fn replace_entry(
        &self,
        cache_key: &str,
        variant_key: &str,
        raw: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock(cache_key).await;
        let key = entry_key(cache_key, variant_key);
        if !self.entry_exists(&key).await? {
            debug!(cache_key, variant_key, "entry removed before rewrite, skipping");
            return Ok(false);
        }
        self.touch_locked(cache_key, variant_key).await?;
        self.set_entry(&key, raw, ttl).await?;
        Ok(true)
    }

    async fn touch_locked(&self, cache_key: &str, variant_key: &str) -> Result<bool, StoreError> {
        let mut added = false;
        for attempt in 1..=TOUCH_ATTEMPTS {
            let mut record = self.load_or_default(cache_key).await?;
            if record.knows(variant_key) {
                return Ok(added);
            }
            record.remember(variant_key);
            self.save(&record).await?;
            added = true;

            let confirmed = self
                .load(cache_key)
                .await?
                .is_some_and(|stored| stored.knows(variant_key));
            if confirmed {
                debug!(cache_key, variant_key, attempt, "recorded variant");
                return Ok(true);
            }
        }

        Err(StoreError::unavailable(format!(
            "variant `{variant_key}` of `{cache_key}` not retained after {TOUCH_ATTEMPTS} writes"
        )))
    }

    /// Delete cached entries for `cache_key`.
    ///
    /// With a variant, only that entry is deleted and the variant forgotten.
    /// Without one, every recorded variant's entry and then the record itself
    /// are deleted; the record survives if any entry delete fails.
    pub async fn invalidate(
        &self,
        cache_key: &str,
        variant_key: Option<&str>,
    ) -> Result<InvalidationReport, StoreError> {
        let _guard = self.lock(cache_key).await;

        match variant_key {
            Some(variant) => {
                let key = entry_key(cache_key, variant);
                let existed = self.entry_exists(&key).await?;
                self.delete_entry(&key).await?;
                if let Some(mut record) = self.load(cache_key).await? {
                    if record.forget(variant) {
                        self.save(&record).await?;
                    }
                }
                Ok(InvalidationReport {
                    entries_deleted: usize::from(existed),
                    record_removed: false,
                })
            }
            None => {
                let mut record = self.load_or_default(cache_key).await?;
                record.remember("");
                let keys = record.entry_keys();
                for key in &keys {
                    self.delete_entry(key).await?;
                }
                bounded(
                    "record_delete",
                    self.timeout,
                    self.store.delete(&self.record_group, cache_key),
                )
                .await?;
                Ok(InvalidationReport {
                    entries_deleted: keys.len(),
                    record_removed: true,
                })
            }
        }
    }

    /// Flip the cacheability flag, creating the record if needed.
    pub async fn set_cacheable(&self, cache_key: &str, cacheable: bool) -> Result<(), StoreError> {
        let _guard = self.lock(cache_key).await;

        let mut record = self.load_or_default(cache_key).await?;
        if record.is_cacheable == cacheable {
            return Ok(());
        }
        record.is_cacheable = cacheable;
        self.save(&record).await
    }

    async fn save(&self, record: &OriginRecord) -> Result<(), StoreError> {
        let raw = record
            .to_bytes()
            .map_err(|error| StoreError::Encode(error.to_string()))?;
        bounded(
            "record_set",
            self.timeout,
            self.store
                .set(&self.record_group, &record.cache_key, Bytes::from(raw), None),
        )
        .await
    }

    async fn entry_exists(&self, key: &str) -> Result<bool, StoreError> {
        let raw = bounded(
            "entry_get",
            self.timeout,
            self.store.get(&self.entry_group, key),
        )
        .await?;
        Ok(raw.is_some())
    }

    async fn set_entry(
        &self,
        key: &str,
        raw: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        bounded(
            "entry_set",
            self.timeout,
            self.store.set(&self.entry_group, key, raw, ttl),
        )
        .await
    }

    async fn delete_entry(&self, key: &str) -> Result<(), StoreError> {
        bounded(
            "entry_delete",
            self.timeout,
            self.store.delete(&self.entry_group, key),
        )
        .await
    }

    async fn lock(&self, cache_key: &str) -> RecordGuard<'_> {
        let slot = self
            .locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RecordGuard {
            locks: &self.locks,
            cache_key: cache_key.to_string(),
            guard: Some(slot.lock_owned().await),
        }
    }
}

/// Holds one record's lock; the slot is dropped from the table once unused.
struct RecordGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    cache_key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.cache_key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;

    fn book() -> (Arc<MemoryStore>, RecordBook) {
        let store = Arc::new(MemoryStore::default());
        let book = RecordBook::new(store.clone(), &CacheConfig::default());
        (store, book)
    }

    async fn put_entry(store: &MemoryStore, key: &str) {
        store
            .set("pagefront", key, Bytes::from_static(b"{}"), None)
            .await
            .expect("set");
    }

    #[tokio::test]
    async fn touch_records_each_variant_once() {
        let (_, book) = book();

        assert!(book.touch("abc", "").await.expect("touch"));
        assert!(book.touch("abc", "v1").await.expect("touch"));
        assert!(!book.touch("abc", "v1").await.expect("touch"));

        let record = book.load("abc").await.expect("load").expect("record");
        assert!(record.knows(""));
        assert!(record.knows("v1"));
        assert!(record.is_cacheable);
    }

    #[tokio::test]
    async fn concurrent_touches_keep_every_variant() {
        let (_, book) = book();
        let book = Arc::new(book);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let book = Arc::clone(&book);
                tokio::spawn(async move { book.touch("abc", &format!("v{i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("touch");
        }

        let record = book.load("abc").await.expect("load").expect("record");
        assert_eq!(record.known_variants.len(), 16);
    }

    #[tokio::test]
    async fn full_invalidation_removes_all_variants_and_record() {
        let (store, book) = book();
        for variant in ["", "v1", "v2"] {
            put_entry(&store, &entry_key("abc", variant)).await;
            book.touch("abc", variant).await.expect("touch");
        }
        put_entry(&store, &entry_key("other", "")).await;

        let report = book.invalidate("abc", None).await.expect("invalidate");

        assert_eq!(report.entries_deleted, 3);
        assert!(report.record_removed);
        assert!(book.load("abc").await.expect("load").is_none());
        for variant in ["", "v1", "v2"] {
            let key = entry_key("abc", variant);
            assert!(store.get("pagefront", &key).await.expect("get").is_none());
        }
        let other = entry_key("other", "");
        assert!(store.get("pagefront", &other).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn single_variant_invalidation_keeps_siblings() {
        let (store, book) = book();
        for variant in ["", "v1"] {
            put_entry(&store, &entry_key("abc", variant)).await;
            book.touch("abc", variant).await.expect("touch");
        }

        book.invalidate("abc", Some("v1")).await.expect("invalidate");

        let record = book.load("abc").await.expect("load").expect("record");
        assert!(record.knows(""));
        assert!(!record.knows("v1"));
        let canonical = entry_key("abc", "");
        assert!(store.get("pagefront", &canonical).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn malformed_record_reads_as_absent() {
        let (store, book) = book();
        store
            .set("pagefront-records", "abc", Bytes::from_static(b"not json"), None)
            .await
            .expect("set");

        assert!(book.load("abc").await.expect("load").is_none());
        assert!(book.touch("abc", "").await.expect("touch"));
    }

    #[tokio::test]
    async fn single_variant_invalidation_counts_only_existing_entries() {
        let (_, book) = book();
        book.touch("abc", "v1").await.expect("touch");

        let report = book.invalidate("abc", Some("v1")).await.expect("invalidate");

        assert_eq!(report.entries_deleted, 0);
        assert!(!report.record_removed);
    }

    #[tokio::test]
    async fn lock_slots_are_released_after_use() {
        let (store, book) = book();
        let book = Arc::new(book);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let book = Arc::clone(&book);
                tokio::spawn(async move { book.touch(&format!("url{}", i % 3), "v").await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("touch");
        }
        put_entry(&store, &entry_key("url0", "v")).await;
        book.invalidate("url0", None).await.expect("invalidate");
        book.set_cacheable("url1", false).await.expect("set");

        assert!(book.locks.is_empty());
    }

    #[tokio::test]
    async fn store_entry_lists_the_variant() {
        let (store, book) = book();

        book.store_entry("abc", "v1", Bytes::from_static(b"{}"), None)
            .await
            .expect("store");

        let record = book.load("abc").await.expect("load").expect("record");
        assert!(record.knows("v1"));
        let key = entry_key("abc", "v1");
        assert!(store.get("pagefront", &key).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn replace_entry_does_not_resurrect_invalidated_pages() {
        let (store, book) = book();
        put_entry(&store, &entry_key("abc", "")).await;
        book.touch("abc", "").await.expect("touch");
        book.invalidate("abc", None).await.expect("invalidate");

        let written = book
            .replace_entry("abc", "", Bytes::from_static(b"{}"), None)
            .await
            .expect("replace");

        assert!(!written);
        let key = entry_key("abc", "");
        assert!(store.get("pagefront", &key).await.expect("get").is_none());
        assert!(book.load("abc").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn set_cacheable_persists_flag() {
        let (_, book) = book();
        book.set_cacheable("abc", false).await.expect("set");
        let record = book.load("abc").await.expect("load").expect("record");
        assert!(!record.is_cacheable);
    }
}
