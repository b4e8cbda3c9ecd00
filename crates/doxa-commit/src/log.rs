//! Delta-style commit log: NDJSON action files under `<ns>/_delta_log/`,
//! addressed by a 20-digit zero-padded version number.

use bytes::Bytes;

use doxa_common::error::{Error, Result};
use doxa_common::types::{Action, CommitEntry};

pub fn delta_log_prefix(ns: &str) -> String {
    format!("{ns}/_delta_log/")
}

pub fn version_path(ns: &str, version: u64) -> String {
    format!("{ns}/_delta_log/{version:020}.json")
}

pub fn data_file_path(ns: &str, uuid: &str) -> String {
    format!("{ns}/{uuid}.parquet")
}

pub fn index_file_path(ns: &str, index_name: &str) -> String {
    format!("{ns}/_indexes/{index_name}.idx")
}

/// Parses the version number out of a full or base object key, e.g.
/// `"orders/_delta_log/00000000000000000003.json"` -> `3`.
pub fn parse_version(key: &str) -> Option<u64> {
    let base = key.rsplit('/').next().unwrap_or(key);
    let digits = base.strip_suffix(".json")?;
    digits.parse().ok()
}

/// Serializes a commit's actions as NDJSON, one action per line.
pub fn encode_actions(actions: &[Action]) -> Result<Bytes> {
    let mut buf = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut buf, action)?;
        buf.push(b'\n');
    }
    Ok(Bytes::from(buf))
}

/// Parses an NDJSON commit-log file into a [`CommitEntry`]. Blank lines are
/// skipped.
pub fn decode_commit_entry(version: u64, bytes: &[u8]) -> Result<CommitEntry> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::ReadError(format!("commit log {version} is not valid utf-8: {e}")))?;
    let mut actions = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let action: Action = serde_json::from_str(line)?;
        actions.push(action);
    }
    Ok(CommitEntry { version, actions })
}
