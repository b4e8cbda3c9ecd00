//! Tagged enum over the three index backends.

use std::path::Path;

use async_trait::async_trait;

use doxa_common::config::Bm25Config;
use doxa_common::error::Result;

use crate::bm25::Bm25Index;
use crate::hash::HashIndex;
use crate::key::{IndexEntry, IndexKey, IndexStats, LookupResult};
use crate::sst::{RangeQuery, ScanOptions, SstIndex};
use crate::traits::SecondaryIndex;

pub enum IndexKind {
    Hash(HashIndex),
    Sst(SstIndex),
    Bm25(Bm25Index),
}

impl IndexKind {
    pub fn hash(sparse: bool) -> Self {
        IndexKind::Hash(HashIndex::new(sparse))
    }

    pub fn sst() -> Self {
        IndexKind::Sst(SstIndex::new())
    }

    pub fn bm25(config: Bm25Config) -> Self {
        IndexKind::Bm25(Bm25Index::new(config))
    }

    /// Only meaningful for [`IndexKind::Sst`]; other backends return an
    /// empty result since they are not range-ordered.
    pub fn range(&self, query: &RangeQuery) -> LookupResult {
        match self {
            IndexKind::Sst(idx) => idx.range(query),
            _ => LookupResult::default(),
        }
    }

    pub fn scan(&self, options: &ScanOptions) -> Vec<IndexEntry> {
        match self {
            IndexKind::Sst(idx) => idx.scan(options),
            _ => Vec::new(),
        }
    }

    pub fn min(&self) -> Option<IndexKey> {
        match self {
            IndexKind::Sst(idx) => idx.min(),
            _ => None,
        }
    }

    pub fn max(&self) -> Option<IndexKey> {
        match self {
            IndexKind::Sst(idx) => idx.max(),
            _ => None,
        }
    }

    pub fn as_bm25(&self) -> Option<&Bm25Index> {
        match self {
            IndexKind::Bm25(idx) => Some(idx),
            _ => None,
        }
    }
}

#[async_trait]
impl SecondaryIndex for IndexKind {
    fn insert(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64) {
        match self {
            IndexKind::Hash(idx) => idx.insert(key, doc_id, row_group, offset),
            IndexKind::Sst(idx) => idx.insert(key, doc_id, row_group, offset),
            IndexKind::Bm25(idx) => idx.insert(key, doc_id, row_group, offset),
        }
    }

    fn remove(&self, key: &IndexKey, doc_id: &str) {
        match self {
            IndexKind::Hash(idx) => idx.remove(key, doc_id),
            IndexKind::Sst(idx) => idx.remove(key, doc_id),
            IndexKind::Bm25(idx) => idx.remove(key, doc_id),
        }
    }

    fn lookup(&self, key: &IndexKey) -> LookupResult {
        match self {
            IndexKind::Hash(idx) => idx.lookup(key),
            IndexKind::Sst(idx) => idx.lookup(key),
            IndexKind::Bm25(idx) => idx.lookup(key),
        }
    }

    fn clear(&self) {
        match self {
            IndexKind::Hash(idx) => idx.clear(),
            IndexKind::Sst(idx) => idx.clear(),
            IndexKind::Bm25(idx) => idx.clear(),
        }
    }

    fn is_sparse(&self) -> bool {
        match self {
            IndexKind::Hash(idx) => idx.is_sparse(),
            IndexKind::Sst(idx) => idx.is_sparse(),
            IndexKind::Bm25(idx) => idx.is_sparse(),
        }
    }

    fn size(&self) -> usize {
        match self {
            IndexKind::Hash(idx) => idx.size(),
            IndexKind::Sst(idx) => idx.size(),
            IndexKind::Bm25(idx) => idx.size(),
        }
    }

    fn unique_key_count(&self) -> usize {
        match self {
            IndexKind::Hash(idx) => idx.unique_key_count(),
            IndexKind::Sst(idx) => idx.unique_key_count(),
            IndexKind::Bm25(idx) => idx.unique_key_count(),
        }
    }

    fn get_stats(&self) -> IndexStats {
        match self {
            IndexKind::Hash(idx) => idx.get_stats(),
            IndexKind::Sst(idx) => idx.get_stats(),
            IndexKind::Bm25(idx) => idx.get_stats(),
        }
    }

    async fn save(&self, path: &Path) -> Result<()> {
        match self {
            IndexKind::Hash(idx) => idx.save(path).await,
            IndexKind::Sst(idx) => idx.save(path).await,
            IndexKind::Bm25(idx) => idx.save(path).await,
        }
    }

    async fn load(&self, path: &Path) -> Result<()> {
        match self {
            IndexKind::Hash(idx) => idx.load(path).await,
            IndexKind::Sst(idx) => idx.load(path).await,
            IndexKind::Bm25(idx) => idx.load(path).await,
        }
    }
}
