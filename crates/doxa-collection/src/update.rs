//! Update-operator semantics: `$set`, `$unset`, `$inc`,
//! `$push`, `$pull`, `$addToSet`, `$rename`, including `$inc` on nested
//! dot-paths. Every path in an incoming spec is validated against the
//! prototype-pollution guard before anything is mutated.

use serde_json::{Map, Value};

use doxa_common::error::{Error, Result};
use doxa_filter::reject_forbidden_path;

/// Applies an update specification to `doc`, returning the new document.
/// `doc` is left untouched; the result is a modified clone. Unknown
/// top-level keys that aren't update operators are rejected, matching the
/// façade's "every incoming document and spec is validated" requirement.
pub fn apply_update(doc: &Value, spec: &Value) -> Result<Value> {
    let Value::Object(spec_map) = spec else {
        return Err(Error::InvalidInput("update spec must be an object".to_string()));
    };

    let mut result = doc.clone();
    for (op, args) in spec_map {
        let Value::Object(fields) = args else {
            return Err(Error::InvalidInput(format!("{op} requires an object of field -> value")));
        };
        for path in fields.keys() {
            reject_forbidden_path(path)?;
        }
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(&mut result, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(&mut result, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let delta = delta.as_f64().ok_or_else(|| {
                        Error::InvalidInput(format!("$inc amount for {path} must be numeric"))
                    })?;
                    let current = get_path(&result, path).and_then(Value::as_f64).unwrap_or(0.0);
                    set_path(&mut result, path, json_number(current + delta));
                }
            }
            "$push" => {
                for (path, value) in fields {
                    push_path(&mut result, path, value.clone(), false);
                }
            }
            "$addToSet" => {
                for (path, value) in fields {
                    push_path(&mut result, path, value.clone(), true);
                }
            }
            "$pull" => {
                for (path, matcher) in fields {
                    pull_path(&mut result, path, matcher)?;
                }
            }
            "$rename" => {
                for (from, to) in fields {
                    let Value::String(to) = to else {
                        return Err(Error::InvalidInput(format!("$rename target for {from} must be a string")));
                    };
                    reject_forbidden_path(to)?;
                    rename_path(&mut result, from, to);
                }
            }
            other => {
                return Err(Error::InvalidInput(format!("unknown update operator {other}")));
            }
        }
    }
    Ok(result)
}

fn json_number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::from(0))
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walks to the parent object of the last path segment, creating
/// intermediate objects as needed, and returns `(parent_map, last_segment)`.
fn navigate_to_parent<'a>(doc: &'a mut Value, path: &str) -> Option<(&'a mut Map<String, Value>, &'a str)> {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    loop {
        let segment = segments.next()?;
        if segments.peek().is_none() {
            let Value::Object(map) = current else {
                return None;
            };
            return Some((map, segment));
        }
        if !matches!(current, Value::Object(_)) {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { unreachable!() };
        current = map.entry(segment).or_insert_with(|| Value::Object(Map::new()));
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    if let Some((parent, last)) = navigate_to_parent(doc, path) {
        parent.insert(last.to_string(), value);
    }
}

fn unset_path(doc: &mut Value, path: &str) {
    if let Some((parent, last)) = navigate_to_parent(doc, path) {
        parent.remove(last);
    }
}

fn rename_path(doc: &mut Value, from: &str, to: &str) {
    let Some(value) = get_path(doc, from).cloned() else {
        return;
    };
    unset_path(doc, from);
    set_path(doc, to, value);
}

fn push_path(doc: &mut Value, path: &str, value: Value, only_if_absent: bool) {
    if let Some((parent, last)) = navigate_to_parent(doc, path) {
        let entry = parent.entry(last.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        if !matches!(entry, Value::Array(_)) {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            if !only_if_absent || !items.contains(&value) {
                items.push(value);
            }
        }
    }
}

fn pull_path(doc: &mut Value, path: &str, matcher: &Value) -> Result<()> {
    let Some((parent, last)) = navigate_to_parent(doc, path) else {
        return Ok(());
    };
    let Some(Value::Array(items)) = parent.get_mut(last) else {
        return Ok(());
    };
    match matcher {
        Value::Object(_) => {
            items.retain(|item| !doxa_filter::matches(item, matcher).unwrap_or(false));
        }
        scalar => {
            items.retain(|item| item != scalar);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_nested_path() {
        let doc = json!({"name": "Ada"});
        let updated = apply_update(&doc, &json!({"$set": {"address.city": "Oxford"}})).unwrap();
        assert_eq!(updated["address"]["city"], json!("Oxford"));
    }

    #[test]
    fn unset_removes_field() {
        let doc = json!({"name": "Ada", "temp": 1});
        let updated = apply_update(&doc, &json!({"$unset": {"temp": ""}})).unwrap();
        assert!(updated.get("temp").is_none());
    }

    #[test]
    fn inc_on_nested_path() {
        let doc = json!({"stats": {"score": 10}});
        let updated = apply_update(&doc, &json!({"$inc": {"stats.score": 5}})).unwrap();
        assert_eq!(updated["stats"]["score"], json!(15.0));
    }

    #[test]
    fn inc_defaults_missing_field_to_zero() {
        let doc = json!({});
        let updated = apply_update(&doc, &json!({"$inc": {"count": 3}})).unwrap();
        assert_eq!(updated["count"], json!(3.0));
    }

    #[test]
    fn push_appends_and_creates_array() {
        let doc = json!({});
        let updated = apply_update(&doc, &json!({"$push": {"tags": "a"}})).unwrap();
        let updated = apply_update(&updated, &json!({"$push": {"tags": "b"}})).unwrap();
        assert_eq!(updated["tags"], json!(["a", "b"]));
    }

    #[test]
    fn add_to_set_skips_duplicates() {
        let doc = json!({"tags": ["a"]});
        let updated = apply_update(&doc, &json!({"$addToSet": {"tags": "a"}})).unwrap();
        assert_eq!(updated["tags"], json!(["a"]));
    }

    #[test]
    fn pull_removes_matching_scalar() {
        let doc = json!({"tags": ["a", "b", "a"]});
        let updated = apply_update(&doc, &json!({"$pull": {"tags": "a"}})).unwrap();
        assert_eq!(updated["tags"], json!(["b"]));
    }

    #[test]
    fn pull_removes_matching_filter() {
        let doc = json!({"items": [{"status": "done"}, {"status": "open"}]});
        let updated = apply_update(&doc, &json!({"$pull": {"items": {"status": "done"}}})).unwrap();
        assert_eq!(updated["items"], json!([{"status": "open"}]));
    }

    #[test]
    fn rename_moves_value_to_new_key() {
        let doc = json!({"old": 42});
        let updated = apply_update(&doc, &json!({"$rename": {"old": "new"}})).unwrap();
        assert_eq!(updated["new"], json!(42));
        assert!(updated.get("old").is_none());
    }

    #[test]
    fn rejects_forbidden_path_in_set() {
        let doc = json!({});
        let err = apply_update(&doc, &json!({"$set": {"__proto__.polluted": true}})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_forbidden_rename_target() {
        let doc = json!({"old": 1});
        let err = apply_update(&doc, &json!({"$rename": {"old": "constructor"}})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_unknown_operator() {
        let doc = json!({});
        let err = apply_update(&doc, &json!({"$frobnicate": {"a": 1}})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
