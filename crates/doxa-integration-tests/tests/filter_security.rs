//! Scenarios 5 and 6: field-level `$not` semantics and
//! prototype-pollution rejection across the filter engine and the
//! collection façade's create/update paths.

use std::sync::Arc;

use serde_json::json;

use doxa_collection::{Collection, CollectionConfig};
use doxa_commit::CommitEngine;
use doxa_common::config::{CacheConfig, CommitConfig};
use doxa_common::error::Error;
use doxa_common::types::{ColumnSpec, ColumnType, Schema};
use doxa_query::{IndexRegistry, InMemoryMvMetadataProvider, QueryExecutor};
use doxa_storage::objectstore::InMemoryObjectStore;

fn variant_schema() -> Schema {
    let mut schema = Schema::default();
    schema.columns.insert("$id".into(), ColumnSpec { column_type: ColumnType::String, optional: false });
    schema.columns.insert("$data".into(), ColumnSpec { column_type: ColumnType::Json, optional: false });
    schema
}

fn collection(ns: &str) -> Collection {
    let store = Arc::new(InMemoryObjectStore::new());
    let engine = Arc::new(CommitEngine::new(store.clone(), CommitConfig::default()));
    let indexes = Arc::new(IndexRegistry::new());
    let mvs = Arc::new(InMemoryMvMetadataProvider::new());
    let executor = Arc::new(QueryExecutor::new(store, CacheConfig::default(), indexes.clone(), mvs));
    let config = CollectionConfig { namespace: ns.to_string(), schema: variant_schema(), bloom_columns: vec![] };
    Collection::new(config, engine, executor, indexes)
}

/// Scenario 5: field-level `$not` negates a single operator at that field,
/// not the whole filter.
#[test]
fn field_level_not_negates_only_that_operator() {
    let low = json!({"score": 50});
    let high = json!({"score": 100});
    let filter = json!({"score": {"$not": {"$gt": 75}}});

    assert!(doxa_filter::matches(&low, &filter).unwrap());
    assert!(!doxa_filter::matches(&high, &filter).unwrap());
}

/// Scenario 6: creating with an own `__proto__` key is rejected with
/// `InvalidInput`, and updating via a path that dot-splits into a
/// forbidden segment is rejected the same way.
#[tokio::test]
async fn prototype_pollution_is_rejected_on_create_and_update() {
    let coll = collection("accounts");

    let err = coll.create(json!({"__proto__": {"polluted": true}})).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let created = coll.create(json!({"name": "Ada"})).await.unwrap();
    let id = created["$id"].as_str().unwrap();

    let err = coll
        .update(id, json!({"$set": {"__proto__.polluted": true}}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    // The object tree actually stored is unaffected: re-reading the entity
    // shows no pollution took hold.
    let fetched = coll.get(id, &doxa_query::QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(fetched["name"], json!("Ada"));
    assert!(fetched.get("__proto__").is_none());
}
