//! MongoDB-style predicate matcher.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use doxa_common::error::Result;

use crate::sanitize::reject_forbidden_keys;

/// A compiled predicate, as returned by [`make_predicate`].
pub type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Evaluates `filter` against `doc` once. Validates `filter` for
/// prototype-pollution before evaluating it.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool> {
    reject_forbidden_keys(filter)?;
    Ok(eval_filter(doc, filter))
}

/// Compiles `filter` into a reusable predicate closure, validating it once
/// up front rather than on every call.
pub fn make_predicate(filter: &Value) -> Result<Predicate> {
    reject_forbidden_keys(filter)?;
    let filter = filter.clone();
    Ok(Box::new(move |doc: &Value| eval_filter(doc, &filter)))
}

/// Dot-path lookup into a JSON document. Numeric segments index into
/// arrays; anything else indexes into objects. Returns `None` if any
/// segment is absent.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn eval_filter(doc: &Value, filter: &Value) -> bool {
    let Value::Object(map) = filter else {
        return false;
    };
    map.iter().all(|(key, value)| eval_top_level(doc, key, value))
}

fn eval_top_level(doc: &Value, key: &str, value: &Value) -> bool {
    match key {
        "$and" => as_filter_array(value).is_some_and(|fs| fs.iter().all(|f| eval_filter(doc, f))),
        "$or" => as_filter_array(value).is_some_and(|fs| fs.iter().any(|f| eval_filter(doc, f))),
        "$nor" => as_filter_array(value).is_some_and(|fs| !fs.iter().any(|f| eval_filter(doc, f))),
        "$not" => !eval_filter(doc, value),
        _ => {
            let field_value = get_path(doc, key);
            eval_field(field_value, value)
        }
    }
}

fn as_filter_array(value: &Value) -> Option<&Vec<Value>> {
    value.as_array()
}

/// Evaluates the predicate for a single field. `spec` is either a plain
/// value (implicit `$eq`) or an operators object.
fn eval_field(field_value: Option<&Value>, spec: &Value) -> bool {
    match spec {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            eval_field_ops(field_value, ops)
        }
        _ => value_eq_null_semantics(field_value, spec),
    }
}

/// All operators in `ops` are evaluated and ANDed together, including a
/// field-level `$not` that shares the object with other operators.
fn eval_field_ops(field_value: Option<&Value>, ops: &Map<String, Value>) -> bool {
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$regex" => eval_regex_with_options(field_value, ops),
        "$options" => true,
        _ => eval_one_op(field_value, op, arg),
    })
}

fn eval_one_op(field_value: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => value_eq_null_semantics(field_value, arg),
        "$ne" => !value_eq_null_semantics(field_value, arg),
        "$gt" => compare(field_value, arg) == Some(Ordering::Greater),
        "$gte" => matches!(compare(field_value, arg), Some(Ordering::Greater) | Some(Ordering::Equal)),
        "$lt" => compare(field_value, arg) == Some(Ordering::Less),
        "$lte" => matches!(compare(field_value, arg), Some(Ordering::Less) | Some(Ordering::Equal)),
        "$in" => arg
            .as_array()
            .is_some_and(|list| field_value.is_some_and(|v| list.iter().any(|item| item == v))),
        "$nin" => !arg
            .as_array()
            .is_some_and(|list| field_value.is_some_and(|v| list.iter().any(|item| item == v))),
        "$exists" => {
            let expected = arg.as_bool().unwrap_or(true);
            field_value.is_some() == expected
        }
        "$type" => arg
            .as_str()
            .is_some_and(|t| field_value.is_some_and(|v| json_type_name(v) == t)),
        "$startsWith" => field_value
            .and_then(Value::as_str)
            .zip(arg.as_str())
            .is_some_and(|(v, p)| v.starts_with(p)),
        "$endsWith" => field_value
            .and_then(Value::as_str)
            .zip(arg.as_str())
            .is_some_and(|(v, p)| v.ends_with(p)),
        "$contains" => field_value
            .and_then(Value::as_str)
            .zip(arg.as_str())
            .is_some_and(|(v, p)| v.contains(p)),
        "$all" => field_value
            .and_then(Value::as_array)
            .zip(arg.as_array())
            .is_some_and(|(v, required)| required.iter().all(|r| v.contains(r))),
        "$size" => field_value
            .and_then(Value::as_array)
            .zip(arg.as_u64())
            .is_some_and(|(v, n)| v.len() as u64 == n),
        "$elemMatch" => field_value
            .and_then(Value::as_array)
            .is_some_and(|items| items.iter().any(|item| eval_elem_match(item, arg))),
        "$not" => !eval_field_ops_or_value(field_value, arg),
        _ => false,
    }
}

fn eval_field_ops_or_value(field_value: Option<&Value>, arg: &Value) -> bool {
    match arg {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            eval_field_ops(field_value, ops)
        }
        _ => value_eq_null_semantics(field_value, arg),
    }
}

fn eval_elem_match(item: &Value, sub_filter: &Value) -> bool {
    match sub_filter {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            eval_field_ops(Some(item), ops)
        }
        Value::Object(_) => eval_filter(item, sub_filter),
        other => item == other,
    }
}

fn eval_regex(field_value: Option<&Value>, pattern_arg: &Value, options: Option<&str>) -> bool {
    let Some(s) = field_value.and_then(Value::as_str) else {
        return false;
    };
    let Some(pattern) = pattern_arg.as_str() else {
        return false;
    };
    let case_insensitive = options.is_some_and(|o| o.contains('i'));
    match RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(re) => re.is_match(s),
        Err(_) => false,
    }
}

/// `$regex` with a sibling `$options` needs both operators; this hook is
/// used instead of the one-arg version in [`eval_one_op`] when `$options`
/// is present alongside `$regex` in the same operators object.
pub(crate) fn eval_regex_with_options(
    field_value: Option<&Value>,
    ops: &Map<String, Value>,
) -> bool {
    let Some(pattern) = ops.get("$regex") else {
        return false;
    };
    let options = ops.get("$options").and_then(Value::as_str);
    eval_regex(field_value, pattern, options)
}

/// Null and missing are equivalent only for `$eq null`; every other
/// comparison fails against a missing or null field.
fn value_eq_null_semantics(field_value: Option<&Value>, target: &Value) -> bool {
    if target.is_null() {
        matches!(field_value, None) || matches!(field_value, Some(Value::Null))
    } else {
        field_value.is_some_and(|v| v == target)
    }
}

fn compare(field_value: Option<&Value>, target: &Value) -> Option<Ordering> {
    let field_value = field_value?;
    match (field_value, target) {
        (Value::Null, _) => None,
        (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_equality() {
        let doc = json!({"name": "Ada"});
        assert!(matches(&doc, &json!({"name": "Ada"})).unwrap());
        assert!(!matches(&doc, &json!({"name": "Bob"})).unwrap());
    }

    #[test]
    fn eq_null_treats_missing_as_equal() {
        let doc = json!({"a": 1});
        assert!(matches(&doc, &json!({"b": {"$eq": null}})).unwrap());
        assert!(matches(&doc, &json!({"a": {"$ne": null}})).unwrap());
    }

    #[test]
    fn comparisons_fail_on_missing_or_null() {
        let doc = json!({"score": null});
        assert!(!matches(&doc, &json!({"score": {"$gt": 0}})).unwrap());
        assert!(!matches(&doc, &json!({"missing": {"$lt": 100}})).unwrap());
    }

    #[test]
    fn dot_path_nested_field() {
        let doc = json!({"a": {"b": {"c": 5}}});
        assert!(matches(&doc, &json!({"a.b.c": 5})).unwrap());
    }

    #[test]
    fn logical_and_or_nor() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(&doc, &json!({"$and": [{"a": 1}, {"b": 2}]})).unwrap());
        assert!(matches(&doc, &json!({"$or": [{"a": 0}, {"b": 2}]})).unwrap());
        assert!(matches(&doc, &json!({"$nor": [{"a": 0}, {"b": 0}]})).unwrap());
    }

    #[test]
    fn top_level_not_negates_subfilter() {
        let doc = json!({"a": 1});
        assert!(matches(&doc, &json!({"$not": {"a": 2}})).unwrap());
        assert!(!matches(&doc, &json!({"$not": {"a": 1}})).unwrap());
    }

    #[test]
    fn field_level_not_on_score() {
        let low = json!({"score": 50});
        let high = json!({"score": 100});
        let filter = json!({"score": {"$not": {"$gt": 75}}});
        assert!(matches(&low, &filter).unwrap());
        assert!(!matches(&high, &filter).unwrap());
    }

    #[test]
    fn field_level_not_ands_with_sibling_ops() {
        let doc = json!({"score": 80});
        // $gt:70 true, $not:{$gt:100} true (80 is not > 100) -> AND true
        let filter = json!({"score": {"$gt": 70, "$not": {"$gt": 100}}});
        assert!(matches(&doc, &filter).unwrap());

        // $gt:90 false -> overall false regardless of $not clause
        let filter2 = json!({"score": {"$gt": 90, "$not": {"$gt": 100}}});
        assert!(!matches(&doc, &filter2).unwrap());
    }

    #[test]
    fn array_operators() {
        let doc = json!({"tags": ["a", "b", "c"]});
        assert!(matches(&doc, &json!({"tags": {"$all": ["a", "b"]}})).unwrap());
        assert!(matches(&doc, &json!({"tags": {"$size": 3}})).unwrap());
        assert!(!matches(&doc, &json!({"tags": {"$size": 2}})).unwrap());
    }

    #[test]
    fn elem_match_on_nested_objects() {
        let doc = json!({"items": [{"qty": 1}, {"qty": 5}]});
        assert!(matches(&doc, &json!({"items": {"$elemMatch": {"qty": {"$gt": 3}}}})).unwrap());
        assert!(!matches(&doc, &json!({"items": {"$elemMatch": {"qty": {"$gt": 10}}}})).unwrap());
    }

    #[test]
    fn string_operators() {
        let doc = json!({"email": "ada@example.com"});
        assert!(matches(&doc, &json!({"email": {"$endsWith": "example.com"}})).unwrap());
        assert!(matches(&doc, &json!({"email": {"$startsWith": "ada"}})).unwrap());
        assert!(matches(&doc, &json!({"email": {"$contains": "@"}})).unwrap());
    }

    #[test]
    fn prototype_pollution_is_rejected() {
        let doc = json!({"a": 1});
        let filter = json!({"a": 1, "__proto__": {"polluted": true}});
        assert!(matches(&doc, &filter).is_err());
    }

    #[test]
    fn in_and_nin() {
        let doc = json!({"status": "open"});
        assert!(matches(&doc, &json!({"status": {"$in": ["open", "pending"]}})).unwrap());
        assert!(matches(&doc, &json!({"status": {"$nin": ["closed"]}})).unwrap());
    }
}
