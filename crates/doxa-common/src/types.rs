//! Core entity, schema, commit-log, and materialized-view types shared
//! across the storage and query core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Keys that must never appear anywhere in an entity's object tree.
pub const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Namespace-qualified entity identifier, `"<namespace>/<local>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(namespace: &str, local: &str) -> Self {
        Self(format!("{namespace}/{local}"))
    }

    /// Parses either a qualified `"ns/local"` id or a bare local id. A bare
    /// id needs the caller's namespace to become qualified.
    pub fn parse(raw: &str, default_namespace: Option<&str>) -> Result<Self> {
        if let Some((ns, local)) = raw.split_once('/') {
            if ns.is_empty() || local.is_empty() {
                return Err(Error::InvalidInput(format!("malformed id: {raw}")));
            }
            Ok(Self(raw.to_string()))
        } else if let Some(ns) = default_namespace {
            Ok(Self::new(ns, raw))
        } else {
            Err(Error::InvalidInput(format!(
                "id {raw} is not namespace-qualified and no default namespace was given"
            )))
        }
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    pub fn local(&self) -> &str {
        self.0.split_once('/').map(|(_, l)| l).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A JSON-compatible document always carrying `$id`, `$type`, `version`, and
/// timestamps. Nested JSON is permitted; forbidden keys are rejected by the
/// filter engine's sanitizer before an entity reaches here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity(pub Map<String, Value>);

impl Entity {
    pub fn id(&self) -> Option<&str> {
        self.0.get("$id").and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<u64> {
        self.0.get("version").and_then(Value::as_u64)
    }

    pub fn set_version(&mut self, version: u64) {
        self.0.insert("version".to_string(), Value::from(version));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

/// Column data type for a namespace's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
    Json,
}

/// A single column's declared type and optionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub optional: bool,
}

/// A namespace's schema: column name -> spec. A schema is `$data`-variant
/// iff both `$id` and `$data` are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: HashMap<String, ColumnSpec>,
}

impl Schema {
    pub fn is_data_variant(&self) -> bool {
        self.columns.contains_key("$id") && self.columns.contains_key("$data")
    }
}

// ---------------------------------------------------------------------
// Delta-style commit log actions
// ---------------------------------------------------------------------

/// One action in a commit's NDJSON log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Add(AddAction),
    Remove(RemoveAction),
    CommitInfo(CommitInfoAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAction {
    pub path: String,
    pub size: u64,
    pub modification_time: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAction {
    pub path: String,
    pub modification_time: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfoAction {
    pub timestamp: i64,
    pub operation: String,
    pub read_version: u64,
}

/// A decoded commit-log file: its version and the actions it contains.
#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub version: u64,
    pub actions: Vec<Action>,
}

impl CommitEntry {
    pub fn adds(&self) -> impl Iterator<Item = &AddAction> {
        self.actions.iter().filter_map(|a| match a {
            Action::Add(add) => Some(add),
            _ => None,
        })
    }

    pub fn removes(&self) -> impl Iterator<Item = &RemoveAction> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove(rm) => Some(rm),
            _ => None,
        })
    }

    pub fn commit_info(&self) -> Option<&CommitInfoAction> {
        self.actions.iter().find_map(|a| match a {
            Action::CommitInfo(info) => Some(info),
            _ => None,
        })
    }
}

/// Summary of one snapshot in the commit history, as returned by
/// `list_snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: u64,
    pub timestamp: i64,
    pub operation: String,
    pub adds: usize,
    pub removes: usize,
}

// ---------------------------------------------------------------------
// Materialized views
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalenessState {
    Fresh,
    Stale,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvDefinition {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<Value>,
}

impl MvDefinition {
    pub fn is_aggregation(&self) -> bool {
        self.group_by.is_some() || self.compute.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvMetadata {
    pub name: String,
    pub definition: MvDefinition,
    pub staleness_state: StalenessState,
    pub usable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

// ---------------------------------------------------------------------
// Streaming events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: i64,
    pub op: EventOp,
    /// `"<namespace>:<local>"`
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl Event {
    /// The namespace portion of `target`.
    pub fn namespace(&self) -> &str {
        self.target.split_once(':').map(|(ns, _)| ns).unwrap_or(&self.target)
    }
}
