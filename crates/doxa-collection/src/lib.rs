//! Collection façade: `find`/`get`/`create`/`update`/
//! `delete` and their bulk variants, update-operator semantics, and the
//! validation pass every incoming document or spec goes through before it
//! reaches the commit engine.
//!
//! Composes [`doxa_commit::CommitEngine`] for writes, [`doxa_query::QueryExecutor`]
//! for reads, [`doxa_filter`] for validation, and [`doxa_query::IndexRegistry`]
//! for best-effort secondary-index maintenance on every successful write.

pub mod update;

use std::sync::Arc;

use serde_json::Value;

use doxa_commit::CommitEngine;
use doxa_common::error::{Error, Result};
use doxa_common::types::{Entity, EntityId, Schema, SnapshotInfo};
use doxa_filter::reject_forbidden_keys;
use doxa_index::IndexKey;
use doxa_query::{IndexRegistry, QueryExecutor, QueryOptions, QueryResult};

pub use update::apply_update;

/// Static configuration for one collection: its namespace, schema, and the
/// columns shredded out for bloom-filter acceleration.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub namespace: String,
    pub schema: Schema,
    pub bloom_columns: Vec<String>,
}

impl CollectionConfig {
    fn bloom_refs(&self) -> Vec<&str> {
        self.bloom_columns.iter().map(String::as_str).collect()
    }
}

/// The collection façade itself. Cheap to clone: every field is an `Arc`
/// or owned config.
#[derive(Clone)]
pub struct Collection {
    config: Arc<CollectionConfig>,
    engine: Arc<CommitEngine>,
    executor: Arc<QueryExecutor>,
    indexes: Arc<IndexRegistry>,
}

impl Collection {
    pub fn new(
        config: CollectionConfig,
        engine: Arc<CommitEngine>,
        executor: Arc<QueryExecutor>,
        indexes: Arc<IndexRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            executor,
            indexes,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    /// The secondary-index registry backing this collection's namespace,
    /// for callers that need to register an index before or after
    /// constructing the collection.
    pub fn indexes(&self) -> &Arc<IndexRegistry> {
        &self.indexes
    }

    /// The underlying commit engine, for callers that need direct access
    /// to snapshot/version state (e.g. orphan-cleanup or conflict tests).
    pub fn engine(&self) -> &Arc<CommitEngine> {
        &self.engine
    }

    /// Normalizes a single-id operation's argument: callers may pass either
    /// a fully-qualified `"<ns>/<local>"` id or a bare local id.
    fn resolve_id(&self, id: &str) -> Result<EntityId> {
        EntityId::parse(id, Some(&self.config.namespace))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn find(&self, filter: Option<Value>, options: &QueryOptions) -> Result<QueryResult> {
        let filter = filter.unwrap_or_else(|| Value::Object(Default::default()));
        reject_forbidden_keys(&filter)?;
        self.executor.execute(&self.config.namespace, &filter, &self.config.schema, options).await
    }

    pub async fn find_one(&self, filter: Option<Value>, options: &QueryOptions) -> Result<Option<Value>> {
        let mut opts = options.clone();
        opts.limit = Some(1);
        let result = self.find(filter, &opts).await?;
        Ok(result.rows.into_iter().next())
    }

    pub async fn get(&self, id: &str, options: &QueryOptions) -> Result<Option<Value>> {
        let resolved = self.resolve_id(id)?;
        self.find_one(Some(serde_json::json!({"$id": resolved.as_str()})), options).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id, &QueryOptions::default()).await?.is_some())
    }

    pub async fn count(&self, filter: Option<Value>) -> Result<usize> {
        let result = self.find(filter, &QueryOptions::default()).await?;
        Ok(result.rows.len())
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.engine.list_snapshots(&self.config.namespace).await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn create(&self, data: Value) -> Result<Value> {
        reject_forbidden_keys(&data)?;
        let entity = Entity::from_value(data)?;
        let created = self
            .engine
            .create(&self.config.namespace, entity, &self.config.schema, &self.config.bloom_refs())
            .await?;
        let value = created.into_value();
        self.index_after_write(None, Some(&value));
        Ok(value)
    }

    pub async fn create_many(&self, data: Vec<Value>) -> Result<Vec<Value>> {
        let mut entities = Vec::with_capacity(data.len());
        for d in &data {
            reject_forbidden_keys(d)?;
        }
        for d in data {
            entities.push(Entity::from_value(d)?);
        }
        let created = self
            .engine
            .create_many(&self.config.namespace, entities, &self.config.schema, &self.config.bloom_refs())
            .await?;
        let values: Vec<Value> = created.into_iter().map(Entity::into_value).collect();
        for value in &values {
            self.index_after_write(None, Some(value));
        }
        Ok(values)
    }

    /// Update-spec–driven read-modify-write of one entity.
    /// `expected_version`, when given, forces a per-entity OCC check.
    pub async fn update(&self, id: &str, spec: Value, expected_version: Option<u64>) -> Result<Option<Value>> {
        let resolved = self.resolve_id(id)?;
        validate_update_spec(&spec)?;

        let mut before: Option<Value> = None;
        let updated = self
            .engine
            .update(
                &self.config.namespace,
                resolved.as_str(),
                &self.config.schema,
                &self.config.bloom_refs(),
                expected_version,
                |old| {
                    before = Some(old.clone());
                    apply_update(old, &spec)
                },
            )
            .await?;

        if let Some(new_value) = &updated {
            self.index_after_write(before.as_ref(), Some(new_value));
        }
        Ok(updated)
    }

    /// Applies `spec` to every entity matching `filter`. Each entity is
    /// updated via its own commit.
    pub async fn update_many(&self, filter: Value, spec: Value) -> Result<usize> {
        validate_update_spec(&spec)?;
        let matched = self.find(Some(filter), &QueryOptions::default()).await?;
        let mut updated_count = 0usize;
        for row in matched.rows {
            let Some(id) = row.get("$id").and_then(Value::as_str) else {
                continue;
            };
            if self.update(id, spec.clone(), None).await?.is_some() {
                updated_count += 1;
            }
        }
        Ok(updated_count)
    }

    /// Deletes one entity. `hard: false` flags the row with `deleted:
    /// true` via the normal update path; `hard: true` physically rewrites
    /// every file containing it.
    pub async fn delete(&self, id: &str, hard: bool) -> Result<bool> {
        let resolved = self.resolve_id(id)?;
        let before = self.get(resolved.as_str(), &QueryOptions::default()).await?;
        let deleted = self
            .engine
            .delete(&self.config.namespace, resolved.as_str(), &self.config.schema, &self.config.bloom_refs(), hard)
            .await?;
        if deleted && hard {
            if let Some(before) = &before {
                self.index_after_write(Some(before), None);
            }
        }
        Ok(deleted)
    }

    pub async fn delete_many(&self, filter: Value, hard: bool) -> Result<usize> {
        reject_forbidden_keys(&filter)?;
        if hard {
            let schema = &self.config.schema;
            let bloom = self.config.bloom_refs();
            let before_rows = self.find(Some(filter.clone()), &QueryOptions::default()).await?.rows;
            let count = self
                .engine
                .hard_delete_entities(&self.config.namespace, schema, &bloom, |entity| {
                    doxa_filter::matches(entity, &filter).unwrap_or(false)
                })
                .await?;
            for row in &before_rows {
                self.index_after_write(Some(row), None);
            }
            return Ok(count);
        }

        let matched = self.find(Some(filter), &QueryOptions::default()).await?;
        let mut deleted_count = 0usize;
        for row in matched.rows {
            let Some(id) = row.get("$id").and_then(Value::as_str) else {
                continue;
            };
            if self.delete(id, false).await? {
                deleted_count += 1;
            }
        }
        Ok(deleted_count)
    }

    pub async fn compact(&self, target_file_size: u64, min_file_size: u64) -> Result<Option<u64>> {
        self.engine
            .compact(&self.config.namespace, &self.config.schema, &self.config.bloom_refs(), target_file_size, min_file_size)
            .await
    }

    /// Best-effort secondary-index maintenance: for every top-level field
    /// present on either side of a write that has a registered index, pull
    /// the old posting and insert the new one. Row-group/offset are
    /// recorded as `0` — the executor only uses the index for doc-id
    /// candidate narrowing, not row-group pruning, so these coordinates are
    /// never read back.
    fn index_after_write(&self, before: Option<&Value>, after: Option<&Value>) {
        let Some(doc_id) = after.or(before).and_then(|v| v.get("$id")).and_then(Value::as_str) else {
            return;
        };

        let mut fields: Vec<&String> = Vec::new();
        if let Some(Value::Object(map)) = before {
            fields.extend(map.keys());
        }
        if let Some(Value::Object(map)) = after {
            fields.extend(map.keys());
        }
        fields.sort();
        fields.dedup();

        for field in fields {
            let Some((_, index)) = self.indexes.get(&self.config.namespace, field) else {
                continue;
            };
            let old_key = before.and_then(|v| v.get(field)).and_then(|v| IndexKey::from_value(v).ok().flatten());
            let new_key = after.and_then(|v| v.get(field)).and_then(|v| IndexKey::from_value(v).ok().flatten());
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                index.remove(&key, doc_id);
            }
            if let Some(key) = new_key {
                index.insert(key, doc_id.to_string(), 0, 0);
            }
        }
    }
}

/// Validates an update spec before it reaches the commit engine: it must be
/// an object of `$operator -> {field: value}` entries, and every field path
/// named anywhere in it must clear the prototype-pollution guard: any path
/// whose dot-split contains a forbidden segment is rejected.
fn validate_update_spec(spec: &Value) -> Result<()> {
    let Value::Object(ops) = spec else {
        return Err(Error::InvalidInput("update spec must be an object".to_string()));
    };
    if ops.is_empty() {
        return Err(Error::InvalidInput("update spec must contain at least one operator".to_string()));
    }
    for (op, fields) in ops {
        if !op.starts_with('$') {
            return Err(Error::InvalidInput(format!("{op} is not a recognized update operator")));
        }
        let Value::Object(fields) = fields else {
            return Err(Error::InvalidInput(format!("{op} requires an object of field -> value")));
        };
        for path in fields.keys() {
            doxa_filter::reject_forbidden_path(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use doxa_common::config::{CacheConfig, CommitConfig};
    use doxa_common::types::{ColumnSpec, ColumnType};
    use doxa_index::{HashIndex, IndexKind};
    use doxa_query::InMemoryMvMetadataProvider;
    use doxa_storage::objectstore::InMemoryObjectStore;
    use serde_json::json;

    fn variant_schema() -> Schema {
        let mut schema = Schema::default();
        schema.columns.insert("$id".into(), ColumnSpec { column_type: ColumnType::String, optional: false });
        schema.columns.insert("$data".into(), ColumnSpec { column_type: ColumnType::Json, optional: false });
        schema.columns.insert("status".into(), ColumnSpec { column_type: ColumnType::String, optional: true });
        schema
    }

    fn collection() -> Collection {
        let store = Arc::new(InMemoryObjectStore::new());
        let engine = Arc::new(CommitEngine::new(store.clone(), CommitConfig::default()));
        let indexes = Arc::new(IndexRegistry::new());
        let mvs = Arc::new(InMemoryMvMetadataProvider::new());
        let executor = Arc::new(QueryExecutor::new(store, CacheConfig::default(), indexes.clone(), mvs));
        let config = CollectionConfig {
            namespace: "orders".to_string(),
            schema: variant_schema(),
            bloom_columns: vec!["status".to_string()],
        };
        Collection::new(config, engine, executor, indexes)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Ada", "status": "pending"})).await.unwrap();
        let id = created["$id"].as_str().unwrap();

        let fetched = coll.get(id, &QueryOptions::default()).await.unwrap().unwrap();
        assert_eq!(fetched["customer"], json!("Ada"));
        assert_eq!(fetched["version"], json!(1));
    }

    #[tokio::test]
    async fn get_accepts_bare_local_id() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Bob"})).await.unwrap();
        let full_id = created["$id"].as_str().unwrap().to_string();
        let local = full_id.split_once('/').unwrap().1;

        let fetched = coll.get(local, &QueryOptions::default()).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn update_applies_set_and_bumps_version() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Ada", "status": "pending"})).await.unwrap();
        let id = created["$id"].as_str().unwrap();

        let updated = coll
            .update(id, json!({"$set": {"status": "completed"}}), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["status"], json!("completed"));
        assert_eq!(updated["version"], json!(2));
    }

    #[tokio::test]
    async fn update_rejects_forbidden_path() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Ada"})).await.unwrap();
        let id = created["$id"].as_str().unwrap();

        let err = coll.update(id, json!({"$set": {"__proto__.polluted": true}}), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn create_rejects_prototype_pollution() {
        let coll = collection();
        let err = coll.create(json!({"__proto__": {"polluted": true}})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn soft_delete_flags_without_removing_row() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Ada"})).await.unwrap();
        let id = created["$id"].as_str().unwrap();

        assert!(coll.delete(id, false).await.unwrap());
        let fetched = coll.get(id, &QueryOptions::default()).await.unwrap().unwrap();
        assert_eq!(fetched["deleted"], json!(true));
    }

    #[tokio::test]
    async fn hard_delete_removes_row_and_index_entry() {
        let coll = collection();
        let hash = Arc::new(IndexKind::Hash(HashIndex::new(false)));
        coll.indexes().register("orders", "status", "status_idx", hash.clone());

        let created = coll.create(json!({"customer": "Ada", "status": "pending"})).await.unwrap();
        let id = created["$id"].as_str().unwrap().to_string();
        assert!(!hash.lookup(&IndexKey::Str("pending".into())).doc_ids.is_empty());

        assert!(coll.delete(&id, true).await.unwrap());
        assert!(hash.lookup(&IndexKey::Str("pending".into())).doc_ids.is_empty());
        assert!(coll.get(&id, &QueryOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_many_applies_to_every_match() {
        let coll = collection();
        for name in ["Ada", "Bob", "Cy"] {
            coll.create(json!({"customer": name, "status": "pending"})).await.unwrap();
        }
        let updated = coll
            .update_many(json!({"status": "pending"}), json!({"$set": {"status": "shipped"}}))
            .await
            .unwrap();
        assert_eq!(updated, 3);
        assert_eq!(coll.count(Some(json!({"status": "shipped"}))).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn count_and_exists() {
        let coll = collection();
        let created = coll.create(json!({"customer": "Ada"})).await.unwrap();
        let id = created["$id"].as_str().unwrap();
        assert_eq!(coll.count(None).await.unwrap(), 1);
        assert!(coll.exists(id).await.unwrap());
        assert!(!coll.exists("orders/does-not-exist").await.unwrap());
    }
}
