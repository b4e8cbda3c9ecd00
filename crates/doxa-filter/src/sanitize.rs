//! Prototype-pollution guards.
//!
//! Rejects any object that has an *own* property named `__proto__`,
//! `constructor`, or `prototype` anywhere in its tree. Sanitization walks
//! own properties only — `serde_json::Map` has no prototype chain to begin
//! with, but the guard keeps the same vocabulary a JS-hosted implementation
//! would use, since that is the attack this check exists to close off.

use serde_json::Value;

use doxa_common::error::{Error, Result};
use doxa_common::types::FORBIDDEN_KEYS;

/// Recursively rejects a JSON value containing a forbidden key anywhere in
/// its object tree.
pub fn reject_forbidden_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter() {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "forbidden key in document tree: {key}"
                    )));
                }
                reject_forbidden_keys(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_forbidden_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Rejects an update-spec path whose dot-split segments include a forbidden
/// key, e.g. `"__proto__.polluted"`.
pub fn reject_forbidden_path(path: &str) -> Result<()> {
    for segment in path.split('.') {
        if FORBIDDEN_KEYS.contains(&segment) {
            return Err(Error::InvalidInput(format!(
                "forbidden key in update path: {path}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_own_proto_key_anywhere_in_tree() {
        let doc = json!({"a": {"b": {"__proto__": {"polluted": true}}}});
        assert!(reject_forbidden_keys(&doc).is_err());
    }

    #[test]
    fn accepts_clean_documents() {
        let doc = json!({"a": 1, "b": {"c": [1, 2, {"d": 3}]}});
        assert!(reject_forbidden_keys(&doc).is_ok());
    }

    #[test]
    fn rejects_forbidden_update_path() {
        assert!(reject_forbidden_path("__proto__.polluted").is_err());
        assert!(reject_forbidden_path("a.constructor.b").is_err());
        assert!(reject_forbidden_path("a.b.c").is_ok());
    }
}
