//! Sorted, range-capable secondary index.

use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use doxa_common::error::Result;

use crate::key::{IndexEntry, IndexKey, LookupResult};
use crate::traits::SecondaryIndex;

/// A half-open or closed range query over index keys. `gt`/`gte` set the
/// lower bound (the tighter of the two wins if both given); `lt`/`lte` set
/// the upper bound the same way.
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub gt: Option<IndexKey>,
    pub gte: Option<IndexKey>,
    pub lt: Option<IndexKey>,
    pub lte: Option<IndexKey>,
}

impl RangeQuery {
    fn lower(&self) -> Bound<IndexKey> {
        match (&self.gt, &self.gte) {
            (Some(g), _) => Bound::Excluded(g.clone()),
            (None, Some(ge)) => Bound::Included(ge.clone()),
            (None, None) => Bound::Unbounded,
        }
    }

    fn upper(&self) -> Bound<IndexKey> {
        match (&self.lt, &self.lte) {
            (Some(l), _) => Bound::Excluded(l.clone()),
            (None, Some(le)) => Bound::Included(le.clone()),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Lower strictly greater than upper means the range is empty by
    /// construction.
    fn is_inverted(&self) -> bool {
        let lower_key = self.gt.as_ref().or(self.gte.as_ref());
        let upper_key = self.lt.as_ref().or(self.lte.as_ref());
        matches!((lower_key, upper_key), (Some(l), Some(u)) if l > u)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Sorted multimap backed by a lock-free skip list, so scans and ranges
/// observe keys in order regardless of insertion order.
pub struct SstIndex {
    entries: SkipMap<IndexKey, RwLock<Vec<IndexEntry>>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(IndexKey, Vec<IndexEntry>)>,
}

impl SstIndex {
    pub fn new() -> Self {
        SstIndex {
            entries: SkipMap::new(),
        }
    }

    pub fn range(&self, query: &RangeQuery) -> LookupResult {
        if query.is_inverted() {
            return LookupResult::default();
        }
        let entries: Vec<IndexEntry> = self
            .entries
            .range((query.lower(), query.upper()))
            .flat_map(|e| e.value().read().clone())
            .collect();
        LookupResult::from_entries(entries)
    }

    /// Iterates all postings in ascending key order, applying `offset` and
    /// `limit` to the flattened sequence.
    pub fn scan(&self, options: &ScanOptions) -> Vec<IndexEntry> {
        let flattened: Vec<IndexEntry> = self
            .entries
            .iter()
            .flat_map(|e| e.value().read().clone())
            .collect();
        let offset = options.offset.unwrap_or(0);
        let iter = flattened.into_iter().skip(offset);
        match options.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn min(&self) -> Option<IndexKey> {
        self.entries.front().map(|e| e.key().clone())
    }

    pub fn max(&self) -> Option<IndexKey> {
        self.entries.back().map(|e| e.key().clone())
    }
}

impl Default for SstIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecondaryIndex for SstIndex {
    fn insert(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64) {
        let entry = IndexEntry { doc_id, row_group, offset };
        match self.entries.get(&key) {
            Some(existing) => existing.value().write().push(entry),
            None => {
                self.entries.insert(key, RwLock::new(vec![entry]));
            }
        }
    }

    fn remove(&self, key: &IndexKey, doc_id: &str) {
        if let Some(existing) = self.entries.get(key) {
            existing.value().write().retain(|e| e.doc_id != doc_id);
        }
    }

    fn lookup(&self, key: &IndexKey) -> LookupResult {
        self.entries
            .get(key)
            .map(|e| LookupResult::from_entries(e.value().read().clone()))
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn size(&self) -> usize {
        self.entries.iter().map(|e| e.value().read().len()).sum()
    }

    fn unique_key_count(&self) -> usize {
        self.entries.len()
    }

    async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().read().clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<()> {
        self.clear();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        for (key, postings) in snapshot.entries {
            self.entries.insert(key, RwLock::new(postings));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OrderedFloat;

    fn num_key(n: f64) -> IndexKey {
        IndexKey::Num(OrderedFloat::new(n))
    }

    fn populated() -> SstIndex {
        let idx = SstIndex::new();
        for n in [50.0, 10.0, 30.0, 20.0, 40.0] {
            idx.insert(num_key(n), format!("doc-{}", n as i64), 0, 0);
        }
        idx
    }

    #[test]
    fn range_gte_lt_excludes_upper_bound() {
        let idx = populated();
        let result = idx.range(&RangeQuery {
            gte: Some(num_key(20.0)),
            lt: Some(num_key(40.0)),
            ..Default::default()
        });
        assert_eq!(result.doc_ids.len(), 2);
    }

    #[test]
    fn inverted_range_is_empty() {
        let idx = populated();
        let result = idx.range(&RangeQuery {
            gt: Some(num_key(40.0)),
            lt: Some(num_key(10.0)),
            ..Default::default()
        });
        assert!(result.doc_ids.is_empty());
    }

    #[test]
    fn scan_returns_sorted_regardless_of_insert_order() {
        let idx = populated();
        let entries = idx.scan(&ScanOptions::default());
        let keys: Vec<i64> = entries.iter().map(|e| e.doc_id[4..].parse().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn scan_respects_offset_and_limit() {
        let idx = populated();
        let entries = idx.scan(&ScanOptions { offset: Some(1), limit: Some(2) });
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn min_and_max() {
        let idx = populated();
        assert_eq!(idx.min(), Some(num_key(10.0)));
        assert_eq!(idx.max(), Some(num_key(50.0)));
    }
}
