//! Namespace-scoped cached read path over an [`ObjectStore`], with a three-tier cache (whole object / footer / metadata / byte
//! range) and optional stale-while-revalidate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use doxa_common::config::CacheConfig;
use doxa_common::error::Result;

use crate::objectstore::{validate_range, ListOptions, ListResult, ObjectHead, ObjectStore};

/// The three content kinds a cached byte range can carry, each with its own
/// default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Data,
    Metadata,
    Bloom,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub content_type: Option<ContentType>,
    pub skip_cache: bool,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_bytes: u64,
    pub fetched_bytes: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    bytes: Bytes,
    inserted_at: Instant,
    ttl: Duration,
    stale_while_revalidate: bool,
    access_count: AtomicUsize,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }

    /// Fresh-or-revalidatable: still servable, possibly stale.
    fn is_servable(&self) -> bool {
        self.is_fresh() || self.stale_while_revalidate
    }
}

/// Removes the least-frequently-accessed entry, if any. LFU-like: a linear
/// scan for the minimum access count, same tradeoff the buffer pool this was
/// adapted from makes for a bounded number of entries.
fn evict_lfu(entries: &DashMap<String, CacheEntry>) {
    let mut min_access = usize::MAX;
    let mut min_key: Option<String> = None;
    for entry in entries.iter() {
        let access = entry.value().access_count.load(Ordering::Relaxed);
        if access < min_access {
            min_access = access;
            min_key = Some(entry.key().clone());
        }
    }
    if let Some(key) = min_key {
        entries.remove(&key);
    }
}

/// Wraps an [`ObjectStore`] with a namespace-scoped, TTL'd, optionally
/// stale-while-revalidate cache. Cache keys are `<namespace>/<path>` for
/// whole objects and `<namespace>/<path>#<suffix>` for ranges, footers, and
/// metadata. Bounded to `config.max_entries` with LFU-like eviction.
pub struct CachedReader {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    config: CacheConfig,
    entries: Arc<DashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    cached_bytes: AtomicU64,
    fetched_bytes: AtomicU64,
}

impl CachedReader {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            config,
            entries: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cached_bytes: AtomicU64::new(0),
            fetched_bytes: AtomicU64::new(0),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}/{}", self.namespace, path)
    }

    fn key_suffixed(&self, path: &str, suffix: &str) -> String {
        format!("{}/{}#{}", self.namespace, path, suffix)
    }

    fn ttl_for(&self, content_type: ContentType, override_ttl: Option<Duration>) -> Duration {
        if let Some(ttl) = override_ttl {
            return ttl;
        }
        match content_type {
            ContentType::Data => Duration::from_secs(self.config.data_ttl_secs),
            ContentType::Metadata => Duration::from_secs(self.config.metadata_ttl_secs),
            ContentType::Bloom => Duration::from_secs(self.config.bloom_ttl_secs),
        }
    }

    fn record_hit(&self, len: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.cached_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_miss(&self, len: usize) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetched_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn insert(&self, key: String, bytes: Bytes, ttl: Duration) {
        let max_entries = self.config.max_entries.max(1);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= max_entries {
                self.evict_one();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                bytes,
                inserted_at: Instant::now(),
                ttl,
                stale_while_revalidate: self.config.stale_while_revalidate,
                access_count: AtomicUsize::new(0),
            },
        );
    }

    /// Evicts the least-frequently-accessed entry to stay under
    /// `max_entries`.
    fn evict_one(&self) {
        evict_lfu(&self.entries);
    }

    async fn cached_get<F, Fut>(
        &self,
        key: String,
        content_type: ContentType,
        opts: &ReadOptions,
        fetch: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Bytes>> + Send + 'static,
    {
        if !opts.skip_cache {
            if let Some(entry) = self.entries.get(&key) {
                if entry.is_servable() {
                    entry.access_count.fetch_add(1, Ordering::Relaxed);
                    self.record_hit(entry.bytes.len());
                    let bytes = entry.bytes.clone();
                    if !entry.is_fresh() {
                        debug!(%key, "serving stale cache entry, scheduling revalidation");
                        self.schedule_revalidate(key.clone(), content_type, opts.ttl, fetch);
                    }
                    return Ok(bytes);
                }
            }
        }

        let bytes = fetch().await?;
        self.record_miss(bytes.len());
        if !opts.skip_cache {
            let ttl = self.ttl_for(content_type, opts.ttl);
            self.insert(key, bytes.clone(), ttl);
        }
        Ok(bytes)
    }

    /// Spawns a best-effort background refresh that replaces the cached
    /// entry on success; failures are logged and otherwise swallowed — the
    /// cache never surfaces a revalidation error to the original caller
    ///.
    fn schedule_revalidate<F, Fut>(
        &self,
        key: String,
        content_type: ContentType,
        ttl_override: Option<Duration>,
        fetch: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Bytes>> + Send + 'static,
    {
        let entries = self.entries.clone();
        let ttl = self.ttl_for(content_type, ttl_override);
        let stale_while_revalidate = self.config.stale_while_revalidate;
        let max_entries = self.config.max_entries.max(1);
        tokio::spawn(async move {
            match fetch().await {
                Ok(bytes) => {
                    let prior_access = entries
                        .get(&key)
                        .map(|e| e.access_count.load(Ordering::Relaxed))
                        .unwrap_or(0);
                    if !entries.contains_key(&key) {
                        while entries.len() >= max_entries {
                            evict_lfu(&entries);
                        }
                    }
                    entries.insert(
                        key,
                        CacheEntry {
                            bytes,
                            inserted_at: Instant::now(),
                            ttl,
                            stale_while_revalidate,
                            access_count: AtomicUsize::new(prior_access),
                        },
                    );
                }
                Err(e) => warn!(error = %e, "stale-while-revalidate refresh failed"),
            }
        });
    }

    /// Reads an entire object, caching it as `ContentType::Data` unless
    /// overridden.
    pub async fn read_parquet(&self, path: &str, opts: ReadOptions) -> Result<Bytes> {
        let key = self.key(path);
        let content_type = opts.content_type.unwrap_or(ContentType::Data);
        let store = self.store.clone();
        let path = path.to_string();
        self.cached_get(key, content_type, &opts, move || {
            let store = store.clone();
            async move { store.get(&path).await }
        })
        .await
    }

    /// Uncached range read; validates bounds before touching the backend.
    pub async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        validate_range(start as i64, end as i64)?;
        let bytes = self.store.get_range(path, start, end - start).await?;
        self.fetched_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Cached range read keyed by an explicit suffix.
    pub async fn read_range_cached(
        &self,
        path: &str,
        start: u64,
        end: u64,
        suffix: &str,
    ) -> Result<Bytes> {
        validate_range(start as i64, end as i64)?;
        let key = self.key_suffixed(path, suffix);
        let store = self.store.clone();
        let path_owned = path.to_string();
        let length = end - start;
        self.cached_get(key, ContentType::Data, &ReadOptions::default(), move || {
            let store = store.clone();
            async move { store.get_range(&path_owned, start, length).await }
        })
        .await
    }

    /// Last 8 bytes of a Parquet file: footer length + `PAR1` magic.
    pub async fn read_parquet_footer(&self, path: &str) -> Result<Bytes> {
        let head = self.store.head(path).await?;
        let (start, len) = crate::columnar::footer_range(head.size);
        self.read_range_cached(path, start, start + len, "footer").await
    }

    /// The metadata section immediately preceding the footer.
    pub async fn read_parquet_metadata(&self, path: &str, size: u64) -> Result<Bytes> {
        let footer = self.read_parquet_footer(path).await?;
        let footer_len = u32::from_le_bytes(footer[0..4].try_into().map_err(|_| {
            doxa_common::error::Error::ReadError("malformed parquet footer".to_string())
        })?);
        let (start, len) = crate::columnar::metadata_range(size, footer_len);
        let key = self.key_suffixed(path, "metadata");
        let store = self.store.clone();
        let path_owned = path.to_string();
        self.cached_get(
            key,
            ContentType::Metadata,
            &ReadOptions::default(),
            move || {
                let store = store.clone();
                async move { store.get_range(&path_owned, start, len).await }
            },
        )
        .await
    }

    /// Deletes specific cache entries (whole-object keys only; suffixed
    /// range/footer/metadata entries for the same path are also purged).
    pub fn invalidate(&self, paths: &[String]) {
        for path in paths {
            let base = self.key(path);
            let suffix_prefix = format!("{base}#");
            self.entries.retain(|k, _| k != &base && !k.starts_with(&suffix_prefix));
        }
    }

    /// Drops every cache entry for this reader's namespace.
    pub fn invalidate_namespace(&self) {
        let prefix = format!("{}/", self.namespace);
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(path).await {
            Ok(_) => Ok(true),
            Err(doxa_common::error::Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_metadata(&self, path: &str) -> Result<ObjectHead> {
        self.store.head(path).await
    }

    pub async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        self.store.list(prefix, opts).await
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
            fetched_bytes: self.fetched_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.cached_bytes.store(0, Ordering::Relaxed);
        self.fetched_bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::{InMemoryObjectStore, PutOptions};

    #[tokio::test]
    async fn hit_ratio_is_zero_with_no_reads() {
        let store = Arc::new(InMemoryObjectStore::new());
        let reader = CachedReader::new(store, "ns", CacheConfig::default());
        assert_eq!(reader.get_stats().hit_ratio(), 0.0);
    }

    #[tokio::test]
    async fn second_read_is_a_cache_hit() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put("a.parquet", Bytes::from_static(b"hello"), PutOptions::default())
            .await
            .unwrap();
        let reader = CachedReader::new(store, "ns", CacheConfig::default());

        reader.read_parquet("a.parquet", ReadOptions::default()).await.unwrap();
        reader.read_parquet("a.parquet", ReadOptions::default()).await.unwrap();

        let stats = reader.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[tokio::test]
    async fn eviction_keeps_entry_count_at_max_entries() {
        let store = Arc::new(InMemoryObjectStore::new());
        for i in 0..5 {
            store
                .put(&format!("{i}.parquet"), Bytes::from_static(b"hello"), PutOptions::default())
                .await
                .unwrap();
        }
        let config = CacheConfig { max_entries: 2, ..CacheConfig::default() };
        let reader = CachedReader::new(store, "ns", config);

        for i in 0..5 {
            reader
                .read_parquet(&format!("{i}.parquet"), ReadOptions::default())
                .await
                .unwrap();
        }

        assert!(reader.entries.len() <= 2);
    }

    #[tokio::test]
    async fn eviction_prefers_least_accessed_entry() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("hot.parquet", Bytes::from_static(b"hello"), PutOptions::default()).await.unwrap();
        store.put("cold.parquet", Bytes::from_static(b"hello"), PutOptions::default()).await.unwrap();
        store.put("new.parquet", Bytes::from_static(b"hello"), PutOptions::default()).await.unwrap();
        let config = CacheConfig { max_entries: 2, ..CacheConfig::default() };
        let reader = CachedReader::new(store, "ns", config);

        reader.read_parquet("hot.parquet", ReadOptions::default()).await.unwrap();
        reader.read_parquet("cold.parquet", ReadOptions::default()).await.unwrap();
        reader.read_parquet("hot.parquet", ReadOptions::default()).await.unwrap();
        reader.read_parquet("new.parquet", ReadOptions::default()).await.unwrap();

        assert!(reader.entries.contains_key("ns/hot.parquet"));
        assert!(reader.entries.contains_key("ns/new.parquet"));
        assert!(!reader.entries.contains_key("ns/cold.parquet"));
    }

    #[tokio::test]
    async fn range_validation_rejects_bad_bounds() {
        let store = Arc::new(InMemoryObjectStore::new());
        let reader = CachedReader::new(store, "ns", CacheConfig::default());
        assert!(reader.read_range("a.parquet", 5, 5).await.is_err());
    }

    #[tokio::test]
    async fn invalidate_namespace_clears_everything() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put("a.parquet", Bytes::from_static(b"hello"), PutOptions::default())
            .await
            .unwrap();
        let reader = CachedReader::new(store, "ns", CacheConfig::default());
        reader.read_parquet("a.parquet", ReadOptions::default()).await.unwrap();
        reader.invalidate_namespace();
        reader.read_parquet("a.parquet", ReadOptions::default()).await.unwrap();
        assert_eq!(reader.get_stats().misses, 2);
    }
}
