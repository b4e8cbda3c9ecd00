//! Read-side table state: replays the commit log into a live file set and
//! scans those files for entities.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use doxa_common::error::{Error, Result};
use doxa_common::types::{CommitEntry, SnapshotInfo};
use doxa_storage::columnar::read_all;
use doxa_storage::objectstore::{ListOptions, ObjectStore};

use crate::log::{decode_commit_entry, delta_log_prefix, parse_version};

/// Lists every commit-log entry up to and including `up_to` (or the whole
/// log if `None`), ordered by version.
pub async fn list_commit_entries(
    store: &dyn ObjectStore,
    ns: &str,
    up_to: Option<u64>,
) -> Result<Vec<CommitEntry>> {
    let prefix = delta_log_prefix(ns);
    let listing = store.list(&prefix, ListOptions::default()).await?;

    let mut versions: Vec<u64> = listing
        .objects
        .iter()
        .filter_map(|o| parse_version(&o.key))
        .filter(|v| up_to.map_or(true, |max| *v <= max))
        .collect();
    versions.sort_unstable();

    let mut entries = Vec::with_capacity(versions.len());
    for version in versions {
        let bytes = store.get(&crate::log::version_path(ns, version)).await?;
        entries.push(decode_commit_entry(version, &bytes)?);
    }
    Ok(entries)
}

/// Replays commit entries into the current live file set.
pub fn live_files(entries: &[CommitEntry]) -> Vec<String> {
    let mut live: HashSet<String> = HashSet::new();
    for entry in entries {
        for add in entry.adds() {
            live.insert(add.path.clone());
        }
        for remove in entry.removes() {
            live.remove(&remove.path);
        }
    }
    let mut paths: Vec<String> = live.into_iter().collect();
    paths.sort_unstable();
    paths
}

/// The highest committed version for `ns`, or 0 if the log is empty.
pub async fn discover_version(store: &dyn ObjectStore, ns: &str) -> Result<u64> {
    let prefix = delta_log_prefix(ns);
    let listing = store.list(&prefix, ListOptions::default()).await?;
    Ok(listing
        .objects
        .iter()
        .filter_map(|o| parse_version(&o.key))
        .max()
        .unwrap_or(0))
}

/// One live data file's decoded rows.
pub struct LiveFile {
    pub path: String,
    pub rows: Vec<Value>,
}

/// Reads every live file's rows as-is (raw Parquet rows, not reconstructed
/// entities — callers needing the full document must reshred `$data`-variant
/// rows themselves).
pub async fn read_live_files(
    store: &Arc<dyn ObjectStore>,
    paths: &[String],
) -> Result<Vec<LiveFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = store.get(path).await?;
        let rows = read_all(bytes)?;
        files.push(LiveFile { path: path.clone(), rows });
    }
    Ok(files)
}

/// Finds the live file containing `id`'s row along with that row's index
/// within the file, scanning in path order. Returns `None` if no live file
/// has the entity.
pub async fn find_entity_file(
    store: &Arc<dyn ObjectStore>,
    paths: &[String],
    id: &str,
) -> Result<Option<(LiveFile, usize)>> {
    for path in paths {
        let bytes = store.get(path).await?;
        let rows = read_all(bytes)?;
        if let Some(idx) = rows.iter().position(|row| row.get("$id").and_then(Value::as_str) == Some(id)) {
            return Ok(Some((LiveFile { path: path.clone(), rows }, idx)));
        }
    }
    Ok(None)
}

/// Builds the `list_snapshots` view directly from commit entries.
pub fn snapshots_from_entries(entries: &[CommitEntry]) -> Result<Vec<SnapshotInfo>> {
    entries
        .iter()
        .map(|entry| {
            let info = entry.commit_info().ok_or_else(|| {
                Error::ReadError(format!("commit {} is missing commitInfo", entry.version))
            })?;
            Ok(SnapshotInfo {
                id: entry.version,
                timestamp: info.timestamp,
                operation: info.operation.clone(),
                adds: entry.adds().count(),
                removes: entry.removes().count(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use doxa_common::types::{Action, AddAction, CommitInfoAction, RemoveAction};

    fn entry(version: u64, adds: Vec<&str>, removes: Vec<&str>) -> CommitEntry {
        let mut actions: Vec<Action> = adds
            .into_iter()
            .map(|p| {
                Action::Add(AddAction {
                    path: p.to_string(),
                    size: 1,
                    modification_time: 0,
                    data_change: true,
                })
            })
            .collect();
        actions.extend(removes.into_iter().map(|p| {
            Action::Remove(RemoveAction {
                path: p.to_string(),
                modification_time: 0,
                data_change: true,
            })
        }));
        actions.push(Action::CommitInfo(CommitInfoAction {
            timestamp: 0,
            operation: "test".to_string(),
            read_version: version.saturating_sub(1),
        }));
        CommitEntry { version, actions }
    }

    #[test]
    fn live_files_reflects_adds_minus_removes() {
        let entries = vec![
            entry(1, vec!["a.parquet", "b.parquet"], vec![]),
            entry(2, vec!["c.parquet"], vec!["a.parquet"]),
        ];
        assert_eq!(live_files(&entries), vec!["b.parquet".to_string(), "c.parquet".to_string()]);
    }

    #[test]
    fn snapshots_report_add_and_remove_counts() {
        let entries = vec![entry(1, vec!["a.parquet", "b.parquet"], vec!["z.parquet"])];
        let snapshots = snapshots_from_entries(&entries).unwrap();
        assert_eq!(snapshots[0].adds, 2);
        assert_eq!(snapshots[0].removes, 1);
    }
}
