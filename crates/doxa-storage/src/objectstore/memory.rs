//! In-memory object store for tests, simulating both conditional-put
//! outcomes atomically.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use doxa_common::error::{Error, Result};

use super::{ListOptions, ListResult, ObjectHead, ObjectMeta, ObjectStore, PutOptions};

#[derive(Clone)]
struct Object {
    bytes: Bytes,
    etag: String,
}

/// An `ObjectStore` backed by a `DashMap`, with a single mutex guarding the
/// check-and-set of conditional writes so two concurrent `put`s can never
/// both observe "key absent".
pub struct InMemoryObjectStore {
    objects: DashMap<String, Object>,
    write_lock: Mutex<()>,
    etag_counter: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            write_lock: Mutex::new(()),
            etag_counter: AtomicU64::new(0),
        }
    }

    fn next_etag(&self) -> String {
        let n = self.etag_counter.fetch_add(1, Ordering::SeqCst);
        format!("etag-{n}")
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        super::validate_range(offset as i64, (offset + length) as i64)?;
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > obj.bytes.len() {
            return Err(Error::ReadError(format!(
                "range {start}..{end} out of bounds for {key} (len={})",
                obj.bytes.len()
            )));
        }
        Ok(obj.bytes.slice(start..end))
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        self.objects
            .get(key)
            .map(|o| ObjectHead {
                size: o.bytes.len() as u64,
                etag: o.etag.clone(),
            })
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Bytes, opts: PutOptions) -> Result<String> {
        let _guard = self.write_lock.lock();

        if opts.if_none_match_star && self.objects.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }

        if let Some(expected_etag) = &opts.if_match {
            match self.objects.get(key) {
                Some(existing) if &existing.etag == expected_etag => {}
                _ => return Err(Error::AlreadyExists(key.to_string())),
            }
        }

        let etag = self.next_etag();
        self.objects.insert(
            key.to_string(),
            Object {
                bytes: value,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.objects.remove(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        let mut objects: Vec<ObjectMeta> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectMeta {
                key: entry.key().clone(),
                size: entry.value().bytes.len() as u64,
                etag: entry.value().etag.clone(),
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        let truncated = if let Some(limit) = opts.limit {
            let was_truncated = objects.len() > limit;
            objects.truncate(limit);
            was_truncated
        } else {
            false
        };

        Ok(ListResult { objects, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_only_put_reports_already_exists_on_second_write() {
        let store = InMemoryObjectStore::new();
        store
            .put("k", Bytes::from_static(b"a"), PutOptions::create_only())
            .await
            .unwrap();

        let err = store
            .put("k", Bytes::from_static(b"b"), PutOptions::create_only())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn concurrent_create_only_puts_exactly_one_wins() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryObjectStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put("k", Bytes::from_static(b"x"), PutOptions::create_only())
                    .await
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn range_read_validates_bounds() {
        let store = InMemoryObjectStore::new();
        store
            .put("k", Bytes::from_static(b"hello"), PutOptions::default())
            .await
            .unwrap();
        assert!(store.get_range("k", 0, 3).await.is_ok());
        assert!(store.get_range("k", 10, 1).await.is_err());
    }
}
