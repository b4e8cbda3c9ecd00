//! Per-namespace, per-field index registrations consulted by the executor
//! for candidate pruning.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use doxa_commit::log::index_file_path;
use doxa_common::error::Result;
use doxa_index::{IndexKind, SecondaryIndex};

struct Registration {
    name: String,
    index: Arc<IndexKind>,
}

/// Maps `(namespace, field)` to the named secondary index backing it. A
/// field may have at most one registered index at a time; re-registering
/// replaces the previous one.
#[derive(Default)]
pub struct IndexRegistry {
    entries: DashMap<(String, String), Registration>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ns: &str, field: &str, name: impl Into<String>, index: Arc<IndexKind>) {
        self.entries.insert(
            (ns.to_string(), field.to_string()),
            Registration { name: name.into(), index },
        );
    }

    pub fn unregister(&self, ns: &str, field: &str) {
        self.entries.remove(&(ns.to_string(), field.to_string()));
    }

    pub fn get(&self, ns: &str, field: &str) -> Option<(String, Arc<IndexKind>)> {
        self.entries
            .get(&(ns.to_string(), field.to_string()))
            .map(|e| (e.name.clone(), e.index.clone()))
    }

    pub fn clear_namespace(&self, ns: &str) {
        self.entries.retain(|(n, _), _| n != ns);
    }

    /// Persists every registered index under `root`, one opaque blob per
    /// index at `<root>/<ns>/_indexes/<name>.idx`.
    pub async fn persist_all(&self, root: &Path) -> Result<()> {
        for entry in self.entries.iter() {
            let (ns, _field) = entry.key();
            let path = root.join(index_file_path(ns, &entry.name));
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            entry.index.save(&path).await?;
        }
        Ok(())
    }

    /// Loads persisted state for a single registered index. A missing blob
    /// is a no-op, matching `SecondaryIndex::load`.
    pub async fn hydrate(&self, root: &Path, ns: &str, field: &str) -> Result<()> {
        let Some((name, index)) = self.get(ns, field) else {
            return Ok(());
        };
        let path = root.join(index_file_path(ns, &name));
        index.load(&path).await
    }
}
