//! Hash (multimap) secondary index.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use doxa_common::error::Result;

use crate::key::{IndexEntry, IndexKey, LookupResult};
use crate::traits::SecondaryIndex;

/// Multimap key → doc-id postings. `sparse` controls whether documents
/// missing the indexed field are skipped (`true`) or recorded under
/// [`IndexKey::Null`] (`false`, the default).
pub struct HashIndex {
    entries: DashMap<IndexKey, HashSet<IndexEntry>>,
    sparse: bool,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    sparse: bool,
    entries: Vec<(IndexKey, Vec<IndexEntry>)>,
}

impl HashIndex {
    pub fn new(sparse: bool) -> Self {
        HashIndex {
            entries: DashMap::new(),
            sparse,
        }
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        HashIndex::new(false)
    }
}

#[async_trait]
impl SecondaryIndex for HashIndex {
    fn insert(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64) {
        self.entries
            .entry(key)
            .or_default()
            .insert(IndexEntry { doc_id, row_group, offset });
    }

    fn remove(&self, key: &IndexKey, doc_id: &str) {
        if let Some(mut set) = self.entries.get_mut(key) {
            set.retain(|e| e.doc_id != doc_id);
        }
    }

    fn lookup(&self, key: &IndexKey) -> LookupResult {
        self.entries
            .get(key)
            .map(|set| LookupResult::from_entries(set.iter().cloned()))
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn is_sparse(&self) -> bool {
        self.sparse
    }

    fn size(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    fn unique_key_count(&self) -> usize {
        self.entries.len()
    }

    async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            sparse: self.sparse,
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
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
            self.entries.insert(key, postings.into_iter().collect());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimap_insert_and_lookup() {
        let idx = HashIndex::default();
        idx.insert(IndexKey::Str("open".into()), "doc1".into(), 0, 0);
        idx.insert(IndexKey::Str("open".into()), "doc2".into(), 1, 0);
        let result = idx.lookup(&IndexKey::Str("open".into()));
        assert_eq!(result.doc_ids.len(), 2);
        assert_eq!(result.row_groups.len(), 2);
    }

    #[test]
    fn remove_drops_only_that_doc() {
        let idx = HashIndex::default();
        idx.insert(IndexKey::Str("open".into()), "doc1".into(), 0, 0);
        idx.insert(IndexKey::Str("open".into()), "doc2".into(), 0, 1);
        idx.remove(&IndexKey::Str("open".into()), "doc1");
        let result = idx.lookup(&IndexKey::Str("open".into()));
        assert_eq!(result.doc_ids, vec!["doc2".to_string()]);
    }

    #[test]
    fn stats_report_entry_and_key_counts() {
        let idx = HashIndex::default();
        idx.insert(IndexKey::Str("a".into()), "doc1".into(), 0, 0);
        idx.insert(IndexKey::Str("a".into()), "doc2".into(), 0, 1);
        idx.insert(IndexKey::Str("b".into()), "doc3".into(), 0, 2);
        let stats = idx.get_stats();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.unique_keys, 2);
    }

    #[test]
    fn build_from_skips_missing_field_when_sparse() {
        let idx = HashIndex::new(true);
        idx.build_from(vec![
            (Some(IndexKey::Str("a".into())), "doc1".into(), 0, 0),
            (None, "doc2".into(), 0, 1),
        ]);
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn build_from_records_null_key_when_not_sparse() {
        let idx = HashIndex::new(false);
        idx.build_from(vec![(None, "doc2".into(), 0, 1)]);
        assert_eq!(idx.size(), 1);
        assert!(idx.exists(&IndexKey::Null));
    }
}
