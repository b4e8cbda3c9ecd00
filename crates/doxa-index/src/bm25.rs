//! BM25 inverted index with corpus statistics.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use doxa_common::config::Bm25Config;
use doxa_common::error::Result;

use crate::key::{IndexEntry, IndexKey, LookupResult};
use crate::traits::SecondaryIndex;

const DEFAULT_FIELD: &str = "_default";

/// A single term occurrence record, accumulated per `(term, doc_id,
/// field)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: String,
    pub field: String,
    pub frequency: u32,
    pub positions: Vec<u64>,
    pub row_group: u32,
}

/// Corpus-wide statistics BM25 scoring is computed against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    pub document_count: u64,
    pub avg_doc_length: f64,
    pub document_frequency: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub doc_id: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

/// `idf(df, N) = ln(1 + (N - df + 0.5)/(df + 0.5))`.
pub fn idf(df: u64, n: u64) -> f64 {
    let df = df as f64;
    let n = n as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// `term_score(tf, dl, avg, idf) = idf * (tf*(k1+1)) / (tf + k1*(1-b+b*dl/avg))`.
pub fn term_score(tf: f64, dl: f64, avg: f64, idf: f64, k1: f64, b: f64) -> f64 {
    if avg == 0.0 {
        return 0.0;
    }
    idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avg))
}

/// `log_scaled_tf(0) = 0`, `log_scaled_tf(tf) = 1 + ln(tf)` otherwise.
pub fn log_scaled_tf(tf: f64) -> f64 {
    if tf <= 0.0 {
        0.0
    } else {
        1.0 + tf.ln()
    }
}

/// `augmented_tf(tf, max_tf) = 0.5 + 0.5 * tf / max_tf`.
pub fn augmented_tf(tf: f64, max_tf: f64) -> f64 {
    if max_tf == 0.0 {
        0.0
    } else {
        0.5 + 0.5 * tf / max_tf
    }
}

pub struct Bm25Index {
    postings: DashMap<String, Vec<Posting>>,
    doc_lengths: DashMap<String, u64>,
    doc_ids: DashSet<String>,
    total_length: AtomicU64,
    k1: f64,
    b: f64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    postings: Vec<(String, Vec<Posting>)>,
    doc_lengths: Vec<(String, u64)>,
    k1: f64,
    b: f64,
}

impl Bm25Index {
    pub fn new(config: Bm25Config) -> Self {
        Bm25Index {
            postings: DashMap::new(),
            doc_lengths: DashMap::new(),
            doc_ids: DashSet::new(),
            total_length: AtomicU64::new(0),
            k1: config.k1,
            b: config.b,
        }
    }

    pub fn insert_term(&self, term: &str, doc_id: &str, field: &str, row_group: u32, position: u64) {
        let mut postings = self.postings.entry(term.to_string()).or_default();
        match postings.iter_mut().find(|p| p.doc_id == doc_id && p.field == field) {
            Some(posting) => {
                posting.frequency += 1;
                posting.positions.push(position);
            }
            None => postings.push(Posting {
                doc_id: doc_id.to_string(),
                field: field.to_string(),
                frequency: 1,
                positions: vec![position],
                row_group,
            }),
        }
        drop(postings);

        self.doc_ids.insert(doc_id.to_string());
        *self.doc_lengths.entry(doc_id.to_string()).or_insert(0) += 1;
        self.total_length.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Tokenizes `text` (lowercase, whitespace-delimited) and records one
    /// occurrence per token, in order, so positions reflect token order.
    pub fn index_document(&self, doc_id: &str, field: &str, row_group: u32, text: &str) {
        for (position, token) in text.split_whitespace().enumerate() {
            let normalized = token.to_lowercase();
            self.insert_term(&normalized, doc_id, field, row_group, position as u64);
        }
    }

    /// Removes every posting for `doc_id` across all terms, correcting
    /// corpus-length bookkeeping. Used when a document is deleted outright.
    pub fn remove_document(&self, doc_id: &str) {
        for mut entry in self.postings.iter_mut() {
            entry.value_mut().retain(|p| p.doc_id != doc_id);
        }
        self.postings.retain(|_, postings| !postings.is_empty());
        if let Some((_, length)) = self.doc_lengths.remove(doc_id) {
            self.total_length.fetch_sub(length, AtomicOrdering::Relaxed);
        }
        self.doc_ids.remove(doc_id);
    }

    pub fn corpus_stats(&self) -> CorpusStats {
        let document_count = self.doc_ids.len() as u64;
        let avg_doc_length = if document_count == 0 {
            0.0
        } else {
            self.total_length.load(AtomicOrdering::Relaxed) as f64 / document_count as f64
        };
        let document_frequency = self
            .postings
            .iter()
            .map(|e| {
                let distinct_docs = e
                    .value()
                    .iter()
                    .map(|p| p.doc_id.as_str())
                    .collect::<std::collections::HashSet<_>>()
                    .len() as u64;
                (e.key().clone(), distinct_docs)
            })
            .collect();
        CorpusStats {
            document_count,
            avg_doc_length,
            document_frequency,
        }
    }

    /// Scores every document matching at least one of `terms`, sorted by
    /// score descending with lexicographic doc-id tiebreak.
    pub fn score_query(&self, terms: &[String]) -> Vec<ScoredDoc> {
        let stats = self.corpus_stats();
        if stats.document_count == 0 {
            return Vec::new();
        }
        let mut scores: HashMap<String, (f64, Vec<String>)> = HashMap::new();
        for term in terms {
            let normalized = term.to_lowercase();
            let Some(postings) = self.postings.get(&normalized) else {
                continue;
            };
            let df = stats.document_frequency.get(&normalized).copied().unwrap_or(0);
            if df == 0 {
                continue;
            }
            let term_idf = idf(df, stats.document_count);
            for posting in postings.iter() {
                let dl = self.doc_lengths.get(&posting.doc_id).map(|v| *v).unwrap_or(0) as f64;
                let score = term_score(
                    posting.frequency as f64,
                    dl,
                    stats.avg_doc_length,
                    term_idf,
                    self.k1,
                    self.b,
                );
                let entry = scores.entry(posting.doc_id.clone()).or_insert((0.0, Vec::new()));
                entry.0 += score;
                if !entry.1.contains(term) {
                    entry.1.push(term.clone());
                }
            }
        }
        let mut results: Vec<ScoredDoc> = scores
            .into_iter()
            .map(|(doc_id, (score, matched_terms))| ScoredDoc { doc_id, score, matched_terms })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        results
    }
}

#[async_trait]
impl SecondaryIndex for Bm25Index {
    fn insert(&self, key: IndexKey, doc_id: String, row_group: u32, offset: u64) {
        if let IndexKey::Str(term) = key {
            self.insert_term(&term, &doc_id, DEFAULT_FIELD, row_group, offset);
        }
    }

    fn remove(&self, key: &IndexKey, doc_id: &str) {
        let IndexKey::Str(term) = key else { return };
        if let Some(mut postings) = self.postings.get_mut(term) {
            let removed_freq: u32 = postings
                .iter()
                .filter(|p| p.doc_id == doc_id)
                .map(|p| p.frequency)
                .sum();
            postings.retain(|p| p.doc_id != doc_id);
            if removed_freq > 0 {
                if let Some(mut length) = self.doc_lengths.get_mut(doc_id) {
                    *length = length.saturating_sub(removed_freq as u64);
                }
                self.total_length.fetch_sub(removed_freq as u64, AtomicOrdering::Relaxed);
            }
        }
    }

    fn lookup(&self, key: &IndexKey) -> LookupResult {
        let IndexKey::Str(term) = key else {
            return LookupResult::default();
        };
        self.postings
            .get(term)
            .map(|postings| {
                LookupResult::from_entries(postings.iter().map(|p| IndexEntry {
                    doc_id: p.doc_id.clone(),
                    row_group: p.row_group,
                    offset: p.positions.first().copied().unwrap_or(0),
                }))
            })
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.postings.clear();
        self.doc_lengths.clear();
        self.doc_ids.clear();
        self.total_length.store(0, AtomicOrdering::Relaxed);
    }

    fn size(&self) -> usize {
        self.postings.iter().map(|e| e.value().len()).sum()
    }

    fn unique_key_count(&self) -> usize {
        self.postings.len()
    }

    async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            postings: self.postings.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            doc_lengths: self.doc_lengths.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            k1: self.k1,
            b: self.b,
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
        for (doc_id, length) in &snapshot.doc_lengths {
            self.doc_ids.insert(doc_id.clone());
            self.total_length.fetch_add(*length, AtomicOrdering::Relaxed);
        }
        for (doc_id, length) in snapshot.doc_lengths {
            self.doc_lengths.insert(doc_id, length);
        }
        for (term, postings) in snapshot.postings {
            self.postings.insert(term, postings);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_index() -> Bm25Index {
        Bm25Index::new(Bm25Config::default())
    }

    #[test]
    fn log_scaled_tf_at_known_fixed_points() {
        assert_eq!(log_scaled_tf(0.0), 0.0);
        assert_eq!(log_scaled_tf(1.0), 1.0);
    }

    #[test]
    fn augmented_tf_is_half_when_tf_equals_max() {
        assert_eq!(augmented_tf(5.0, 5.0), 1.0);
        assert_eq!(augmented_tf(0.0, 5.0), 0.5);
    }

    #[test]
    fn score_query_ranks_higher_term_frequency_first() {
        let idx = default_index();
        idx.index_document("doc1", "body", 0, "rust rust rust database");
        idx.index_document("doc2", "body", 0, "rust database database");
        let results = idx.score_query(&["rust".to_string()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc_id, "doc1");
    }

    #[test]
    fn score_query_breaks_ties_lexicographically() {
        let idx = default_index();
        idx.index_document("b", "body", 0, "rust");
        idx.index_document("a", "body", 0, "rust");
        let results = idx.score_query(&["rust".to_string()]);
        assert_eq!(results[0].doc_id, "a");
        assert_eq!(results[1].doc_id, "b");
    }

    #[test]
    fn remove_document_clears_all_its_postings() {
        let idx = default_index();
        idx.index_document("doc1", "body", 0, "rust database");
        idx.remove_document("doc1");
        assert!(idx.score_query(&["rust".to_string()]).is_empty());
        assert_eq!(idx.corpus_stats().document_count, 0);
    }

    #[test]
    fn empty_corpus_scores_nothing() {
        let idx = default_index();
        assert!(idx.score_query(&["rust".to_string()]).is_empty());
    }

    #[test]
    fn term_score_is_monotone_nondecreasing_in_tf() {
        let (dl, avg, idf_val, k1, b) = (10.0, 10.0, 1.5, 1.2, 0.75);
        let mut prev = term_score(0.0, dl, avg, idf_val, k1, b);
        for tf in 1..10 {
            let score = term_score(tf as f64, dl, avg, idf_val, k1, b);
            assert!(score >= prev, "term_score should not decrease as tf grows");
            prev = score;
        }
    }

    #[test]
    fn term_score_strictly_decreases_with_doc_length_at_fixed_tf() {
        let (tf, avg, idf_val, k1, b) = (3.0, 10.0, 1.5, 1.2, 0.75);
        let short = term_score(tf, 5.0, avg, idf_val, k1, b);
        let long = term_score(tf, 20.0, avg, idf_val, k1, b);
        assert!(long < short, "longer documents should score lower at fixed tf");
    }
}
