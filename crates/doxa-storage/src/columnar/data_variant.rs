//! `$data`-variant detection, projection, and reconstruction.

use serde_json::Value;

use doxa_common::types::Schema;

/// True iff the schema has both `$id` and `$data` columns.
pub fn detect_data_variant(schema: &Schema) -> bool {
    schema.is_data_variant()
}

/// Returns `[$id, $data, ...extra]` when `schema` is `$data`-variant, else
/// `None`.
pub fn get_data_variant_columns(schema: &Schema, extra: &[&str]) -> Option<Vec<String>> {
    if !detect_data_variant(schema) {
        return None;
    }
    let mut cols = vec!["$id".to_string(), "$data".to_string()];
    cols.extend(extra.iter().map(|s| s.to_string()));
    Some(cols)
}

/// Reconstructs a full entity from a `$data`-variant row. The outer `$id`
/// column is authoritative over any `$id` embedded in `$data`. On invalid JSON or a null `$data`, falls back to
/// `{$id: row.$id}`.
pub fn reconstruct_entity(row: &Value) -> Value {
    let outer_id = row.get("$id").cloned().unwrap_or(Value::Null);

    let data_value = row.get("$data");
    let parsed = match data_value {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.clone()),
    };

    match parsed {
        Some(Value::Object(mut map)) => {
            map.insert("$id".to_string(), outer_id);
            Value::Object(map)
        }
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("$id".to_string(), outer_id);
            Value::Object(map)
        }
    }
}

/// The write-side counterpart to [`reconstruct_entity`]: shreds a full
/// entity into a `$data`-variant row, serializing the whole entity into
/// `$data` and pulling any additional declared columns out by dot-path for
/// predicate pushdown / indexing. Schemas that are not `$data`-variant are
/// passed through unchanged, since every field is already its own column.
pub fn shred_entity(entity: &Value, schema: &Schema) -> Value {
    if !detect_data_variant(schema) {
        return entity.clone();
    }
    let id = entity.get("$id").cloned().unwrap_or(Value::Null);
    let data = serde_json::to_string(entity).unwrap_or_else(|_| "null".to_string());

    let mut row = serde_json::Map::new();
    row.insert("$id".to_string(), id);
    row.insert("$data".to_string(), Value::String(data));
    for col in schema.columns.keys() {
        if col == "$id" || col == "$data" {
            continue;
        }
        if let Some(v) = get_dotted(entity, col) {
            row.insert(col.clone(), v.clone());
        }
    }
    Value::Object(row)
}

fn get_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use doxa_common::types::{ColumnSpec, ColumnType};
    use serde_json::json;

    fn variant_schema() -> Schema {
        let mut schema = Schema::default();
        schema.columns.insert(
            "$id".to_string(),
            ColumnSpec { column_type: ColumnType::String, optional: false },
        );
        schema.columns.insert(
            "$data".to_string(),
            ColumnSpec { column_type: ColumnType::Json, optional: false },
        );
        schema
    }

    #[test]
    fn detects_data_variant() {
        assert!(detect_data_variant(&variant_schema()));
        assert!(!detect_data_variant(&Schema::default()));
    }

    #[test]
    fn outer_id_wins_over_embedded_id() {
        let row = json!({
            "$id": "users/1",
            "$data": r#"{"$id":"users/stale","name":"Ada"}"#,
        });
        let entity = reconstruct_entity(&row);
        assert_eq!(entity["$id"], json!("users/1"));
        assert_eq!(entity["name"], json!("Ada"));
    }

    #[test]
    fn invalid_json_falls_back_to_id_only() {
        let row = json!({"$id": "users/1", "$data": "not json"});
        let entity = reconstruct_entity(&row);
        assert_eq!(entity, json!({"$id": "users/1"}));
    }

    #[test]
    fn null_data_falls_back_to_id_only() {
        let row = json!({"$id": "users/1", "$data": null});
        let entity = reconstruct_entity(&row);
        assert_eq!(entity, json!({"$id": "users/1"}));
    }

    #[test]
    fn shred_then_reconstruct_round_trips() {
        let mut schema = variant_schema();
        schema.columns.insert(
            "status".to_string(),
            ColumnSpec { column_type: ColumnType::String, optional: true },
        );
        let entity = json!({"$id": "users/1", "name": "Ada", "status": "active"});
        let row = shred_entity(&entity, &schema);
        assert_eq!(row["status"], json!("active"));
        let reconstructed = reconstruct_entity(&row);
        assert_eq!(reconstructed["name"], json!("Ada"));
        assert_eq!(reconstructed["$id"], json!("users/1"));
    }

    #[test]
    fn columns_include_extra_shredded_fields() {
        let cols = get_data_variant_columns(&variant_schema(), &["status"]).unwrap();
        assert_eq!(cols, vec!["$id", "$data", "status"]);
    }
}
