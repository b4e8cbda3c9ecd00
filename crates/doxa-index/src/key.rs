//! Shared index key and posting types.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use doxa_common::error::{Error, Result};

/// A totally-ordered wrapper around `f64` so numeric keys can live in a
/// sorted index. NaN is rejected at construction; `-0.0` and `0.0` compare
/// and hash equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl OrderedFloat {
    pub fn new(v: f64) -> Self {
        OrderedFloat(if v == 0.0 { 0.0 } else { v })
    }
}

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.to_bits());
    }
}

/// A secondary-index key. Composite keys are ordered tuples; `Null` stands in for a document missing the indexed field on a
/// non-sparse index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Str(String),
    Num(OrderedFloat),
    Timestamp(i64),
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Builds a key from a JSON value, as extracted from a field during
    /// `build_from`. Returns `None` for `Value::Null` / missing, which
    /// callers turn into [`IndexKey::Null`] or skip depending on
    /// sparseness.
    pub fn from_value(value: &Value) -> Result<Option<IndexKey>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(IndexKey::Str(s.clone()))),
            Value::Number(n) => Ok(Some(IndexKey::Num(OrderedFloat::new(n.as_f64().ok_or_else(
                || Error::InvalidInput("non-finite index key".into()),
            )?)))),
            other => Err(Error::InvalidInput(format!(
                "unsupported index key value: {other}"
            ))),
        }
    }

    pub fn composite(parts: Vec<IndexKey>) -> IndexKey {
        IndexKey::Composite(parts)
    }
}

/// A single posting: where in the table a key's document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub doc_id: String,
    pub row_group: u32,
    pub offset: u64,
}

/// Result of a point or range lookup: the matching document ids and the
/// distinct row groups they live in, so the query executor can intersect
/// row-group candidate sets cheaply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    pub doc_ids: Vec<String>,
    pub row_groups: Vec<u32>,
}

impl LookupResult {
    pub fn from_entries(entries: impl IntoIterator<Item = IndexEntry>) -> Self {
        let mut doc_ids = Vec::new();
        let mut row_groups = Vec::new();
        for entry in entries {
            if !doc_ids.contains(&entry.doc_id) {
                doc_ids.push(entry.doc_id);
            }
            if !row_groups.contains(&entry.row_group) {
                row_groups.push(entry.row_group);
            }
        }
        LookupResult { doc_ids, row_groups }
    }

    pub fn merge(mut self, other: LookupResult) -> Self {
        for doc_id in other.doc_ids {
            if !self.doc_ids.contains(&doc_id) {
                self.doc_ids.push(doc_id);
            }
        }
        for rg in other.row_groups {
            if !self.row_groups.contains(&rg) {
                self.row_groups.push(rg);
            }
        }
        self
    }
}

/// Statistics common to every index backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub entry_count: usize,
    pub unique_keys: usize,
    pub size_bytes: usize,
}
