//! The common secondary-index interface shared by the hash, SST, and BM25
//! backends.

use std::path::Path;

use async_trait::async_trait;

use doxa_common::error::Result;

use crate::key::{IndexEntry, IndexKey, IndexStats, LookupResult};

/// Operations every secondary-index backend supports. Methods take `&self`
/// because each backend holds its mutable state behind interior
/// concurrency primitives (`DashMap`, `SkipMap`), matching how indexes are
/// shared as `Arc<IndexKind>` across concurrent readers and the commit
/// engine's post-commit index maintenance.
#[async_trait]
pub trait SecondaryIndex: Send + Sync {
    fn insert(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64);

    fn remove(&self, key: &IndexKey, doc_id: &str);

    /// Replaces any existing posting for `doc_id` under `key` with the new
    /// row-group/offset, without requiring the caller to know the old key.
    fn update(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64) {
        self.remove(&key, &doc_id);
        self.insert(key, doc_id, row_group, offset);
    }

    fn lookup(&self, key: &IndexKey) -> LookupResult;

    fn lookup_in(&self, keys: &[IndexKey]) -> LookupResult {
        keys.iter()
            .map(|k| self.lookup(k))
            .fold(LookupResult::default(), LookupResult::merge)
    }

    fn exists(&self, key: &IndexKey) -> bool {
        !self.lookup(key).doc_ids.is_empty()
    }

    fn clear(&self);

    /// Rebuilds the index from scratch given `(key, doc_id, row_group,
    /// offset)` tuples, where `key` is `None` for a document missing the
    /// indexed field.
    fn build_from(&self, docs: Vec<(Option<IndexKey>, String, u32, u64)>) {
        self.clear();
        for (key, doc_id, row_group, offset) in docs {
            match key {
                Some(key) => self.insert(key, doc_id, row_group, offset),
                None if self.is_sparse() => {}
                None => self.insert(IndexKey::Null, doc_id, row_group, offset),
            }
        }
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn size(&self) -> usize;

    fn unique_key_count(&self) -> usize;

    fn get_stats(&self) -> IndexStats {
        IndexStats {
            entry_count: self.size(),
            unique_keys: self.unique_key_count(),
            size_bytes: self.size() * std::mem::size_of::<IndexEntry>(),
        }
    }

    async fn save(&self, path: &Path) -> Result<()>;

    /// Loads persisted state from `path`. A missing file is a no-op: the
    /// index becomes empty and ready.
    async fn load(&self, path: &Path) -> Result<()>;
}
