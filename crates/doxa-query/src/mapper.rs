//! Mapper expressions accepted at the executor boundary. Only path-mappers and
//! a registered-mapper table are accepted; no free-form function bodies
//! ever reach the executor.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use doxa_common::error::{Error, Result};
use doxa_filter::get_path;

/// A mapper expression in a query chain: `{"mapperType":"path","path":"a.b.c[0]"}`
/// or `{"mapperType":"registered","name":"<id>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mapperType", rename_all = "camelCase")]
pub enum Mapper {
    Path { path: String },
    Registered { name: String },
}

/// A function a registered mapper may apply to a document, named by id.
/// This is the closed, safe substitute for the source's serialized-closure
/// "map" mechanism — only functions explicitly registered at startup are
/// reachable this way.
pub type RegisteredMapperFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Table of named mapper functions the executor may invoke via a
/// `Mapper::Registered` expression.
#[derive(Default, Clone)]
pub struct MapperRegistry {
    mappers: Arc<DashMap<String, RegisteredMapperFn>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, f: RegisteredMapperFn) {
        self.mappers.insert(name.into(), f);
    }

    pub fn clear(&self) {
        self.mappers.clear();
    }

    /// Applies `mapper` to `doc`. A `Path` mapper supports dotted field
    /// access with `[n]` array indexing folded into the dot-path the
    /// filter engine already understands (`a.b[0]` -> `a.b.0`).
    pub fn apply(&self, mapper: &Mapper, doc: &Value) -> Result<Value> {
        match mapper {
            Mapper::Path { path } => {
                let normalized = normalize_bracket_indices(path);
                Ok(get_path(doc, &normalized).cloned().unwrap_or(Value::Null))
            }
            Mapper::Registered { name } => {
                let f = self.mappers.get(name).ok_or_else(|| {
                    Error::InvalidInput(format!("no registered mapper named {name}"))
                })?;
                Ok(f(doc))
            }
        }
    }
}

/// Rewrites `a.b[0].c` into `a.b.0.c` so the filter engine's dot-path
/// lookup (which only understands plain segments) can walk it.
fn normalize_bracket_indices(path: &str) -> String {
    path.replace('[', ".").replace(']', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_mapper_supports_bracket_indexing() {
        let registry = MapperRegistry::new();
        let doc = json!({"a": {"b": [10, 20, 30]}});
        let mapper = Mapper::Path { path: "a.b[1]".to_string() };
        assert_eq!(registry.apply(&mapper, &doc).unwrap(), json!(20));
    }

    #[test]
    fn missing_path_maps_to_null() {
        let registry = MapperRegistry::new();
        let doc = json!({"a": 1});
        let mapper = Mapper::Path { path: "missing.field".to_string() };
        assert_eq!(registry.apply(&mapper, &doc).unwrap(), Value::Null);
    }

    #[test]
    fn registered_mapper_is_invoked_by_name() {
        let registry = MapperRegistry::new();
        registry.register("double_score", Arc::new(|doc| {
            let score = doc.get("score").and_then(Value::as_f64).unwrap_or(0.0);
            json!(score * 2.0)
        }));
        let doc = json!({"score": 21});
        let mapper = Mapper::Registered { name: "double_score".to_string() };
        assert_eq!(registry.apply(&mapper, &doc).unwrap(), json!(42.0));
    }

    #[test]
    fn unregistered_mapper_is_invalid_input() {
        let registry = MapperRegistry::new();
        let mapper = Mapper::Registered { name: "nope".to_string() };
        assert!(registry.apply(&mapper, &json!({})).is_err());
    }

    #[test]
    fn clear_removes_every_registration() {
        let registry = MapperRegistry::new();
        registry.register("id", Arc::new(|doc| doc.clone()));
        registry.clear();
        let mapper = Mapper::Registered { name: "id".to_string() };
        assert!(registry.apply(&mapper, &json!({})).is_err());
    }
}
