//! The commit engine — the hardest piece. Maintains the
//! Delta-style log and provides ACID-per-commit semantics against an
//! object store that offers only conditional-put.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use doxa_common::config::CommitConfig;
use doxa_common::error::{Error, Result};
use doxa_common::types::{AddAction, Entity, RemoveAction, Schema, SnapshotInfo};
use doxa_storage::columnar::data_variant::{reconstruct_entity, shred_entity};
use doxa_storage::columnar::{encode, read_all};
use doxa_storage::objectstore::{ObjectStore, PutOptions};

use crate::log::{data_file_path, encode_actions, version_path};
use crate::table;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A planned commit: the files to add and remove, and the newly staged
/// paths that must be cleaned up if the commit doesn't land.
struct CommitPlan {
    adds: Vec<AddAction>,
    removes: Vec<RemoveAction>,
    staged_paths: Vec<String>,
}

/// Delta-style commit log engine. Cloneable cheaply: internal state is an
/// `Arc<dyn ObjectStore>` plus a per-namespace version cache.
pub struct CommitEngine {
    store: Arc<dyn ObjectStore>,
    config: CommitConfig,
    versions: DashMap<String, u64>,
}

impl CommitEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: CommitConfig) -> Self {
        CommitEngine {
            store,
            config,
            versions: DashMap::new(),
        }
    }

    /// Current cached version for `ns`, discovering it from the log on
    /// first use.
    pub async fn current_version(&self, ns: &str) -> Result<u64> {
        if let Some(v) = self.versions.get(ns) {
            return Ok(*v);
        }
        let v = table::discover_version(self.store.as_ref(), ns).await?;
        self.versions.insert(ns.to_string(), v);
        Ok(v)
    }

    /// The backing object store, for callers that need to inspect or seed
    /// raw state directly (e.g. fabricating a conflicting commit file in a
    /// test).
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn list_snapshots(&self, ns: &str) -> Result<Vec<SnapshotInfo>> {
        let entries = table::list_commit_entries(self.store.as_ref(), ns, None).await?;
        table::snapshots_from_entries(&entries)
    }

    async fn backoff(&self, attempt: u32) {
        let shift = attempt.min(20);
        let base = self.config.base_backoff_ms.saturating_mul(1u64 << shift);
        let capped = base.min(self.config.max_backoff_ms);
        let jitter_bound = (capped / 10).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_bound);
        tokio::time::sleep(Duration::from_millis(capped + jitter)).await;
    }

    async fn cleanup_orphans(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        if let Err(e) = self.store.delete(paths).await {
            tracing::warn!(error = %e, "failed to clean up orphaned staged files");
        }
    }

    async fn stage_file(&self, ns: &str, schema: &Schema, rows: &[Value], bloom_columns: &[&str]) -> Result<AddAction> {
        let path = data_file_path(ns, &Uuid::new_v4().to_string());
        let bytes = encode(rows, schema, bloom_columns)?;
        let size = bytes.len() as u64;
        self.store.put(&path, bytes, PutOptions::default()).await?;
        Ok(AddAction {
            path,
            size,
            modification_time: now_millis(),
            data_change: true,
        })
    }

    async fn put_commit(&self, ns: &str, read_version: u64, operation: &str, plan: &CommitPlan) -> Result<u64> {
        let mut actions = Vec::with_capacity(plan.adds.len() + plan.removes.len() + 1);
        actions.extend(plan.adds.iter().cloned().map(doxa_common::types::Action::Add));
        actions.extend(plan.removes.iter().cloned().map(doxa_common::types::Action::Remove));
        actions.push(doxa_common::types::Action::CommitInfo(doxa_common::types::CommitInfoAction {
            timestamp: now_millis(),
            operation: operation.to_string(),
            read_version,
        }));
        let next_version = read_version + 1;
        let bytes = encode_actions(&actions)?;
        self.store
            .put(&version_path(ns, next_version), bytes, PutOptions::create_only())
            .await?;
        self.versions.insert(ns.to_string(), next_version);
        Ok(next_version)
    }

    /// Commits a plan that does not depend on the read snapshot (a "blind
    /// write": retrying only retargets the commit number, the staged files
    /// are reused across attempts).
    async fn commit_blind(&self, ns: &str, operation: &str, plan: CommitPlan) -> Result<u64> {
        let mut attempt = 0u32;
        let mut read_version = self.current_version(ns).await?;
        loop {
            match self.put_commit(ns, read_version, operation, &plan).await {
                Ok(v) => return Ok(v),
                Err(Error::AlreadyExists(_)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.cleanup_orphans(&plan.staged_paths).await;
                        return Err(Error::commit_conflict(ns, attempt));
                    }
                    self.backoff(attempt).await;
                    read_version = table::discover_version(self.store.as_ref(), ns).await?;
                    self.versions.insert(ns.to_string(), read_version);
                }
                Err(e) => {
                    self.cleanup_orphans(&plan.staged_paths).await;
                    return Err(e);
                }
            }
        }
    }

    /// Commits a read-modify-write plan, re-running `build` against the
    /// freshly discovered snapshot on every conflict. `build` returns `None`
    /// when there is nothing to change (e.g. no matching entity), in which
    /// case no commit is attempted.
    async fn commit_replanned<F, Fut>(&self, ns: &str, operation: &str, mut build: F) -> Result<Option<u64>>
    where
        F: FnMut(u64) -> Fut,
        Fut: std::future::Future<Output = Result<Option<CommitPlan>>>,
    {
        let mut attempt = 0u32;
        let mut read_version = self.current_version(ns).await?;
        loop {
            let Some(plan) = build(read_version).await? else {
                return Ok(None);
            };
            match self.put_commit(ns, read_version, operation, &plan).await {
                Ok(v) => return Ok(Some(v)),
                Err(Error::AlreadyExists(_)) => {
                    self.cleanup_orphans(&plan.staged_paths).await;
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(Error::commit_conflict(ns, attempt));
                    }
                    self.backoff(attempt).await;
                    read_version = table::discover_version(self.store.as_ref(), ns).await?;
                    self.versions.insert(ns.to_string(), read_version);
                }
                Err(e) => {
                    self.cleanup_orphans(&plan.staged_paths).await;
                    return Err(e);
                }
            }
        }
    }

    /// Creates a new entity, assigning `$id` if the caller didn't supply
    /// one.
    pub async fn create(&self, ns: &str, mut entity: Entity, schema: &Schema, bloom_columns: &[&str]) -> Result<Entity> {
        if entity.id().is_none() {
            entity.0.insert("$id".to_string(), Value::String(format!("{ns}/{}", Uuid::new_v4())));
        }
        entity.set_version(1);
        let row = shred_entity(&entity.clone().into_value(), schema);
        let add = self.stage_file(ns, schema, &[row], bloom_columns).await?;
        let staged_paths = vec![add.path.clone()];
        let plan = CommitPlan { adds: vec![add], removes: vec![], staged_paths };
        self.commit_blind(ns, "create", plan).await?;
        Ok(entity)
    }

    /// Bulk create: all new rows land in a single staged file, committed
    /// atomically.
    pub async fn create_many(&self, ns: &str, mut entities: Vec<Entity>, schema: &Schema, bloom_columns: &[&str]) -> Result<Vec<Entity>> {
        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            if entity.id().is_none() {
                entity.0.insert("$id".to_string(), Value::String(format!("{ns}/{}", Uuid::new_v4())));
            }
            entity.set_version(1);
            rows.push(shred_entity(&entity.clone().into_value(), schema));
        }
        let add = self.stage_file(ns, schema, &rows, bloom_columns).await?;
        let staged_paths = vec![add.path.clone()];
        let plan = CommitPlan { adds: vec![add], removes: vec![], staged_paths };
        self.commit_blind(ns, "createMany", plan).await?;
        Ok(entities)
    }

    /// Read-modify-write update of a single entity. `apply` receives the
    /// current full entity and returns the new one; `version` is bumped
    /// automatically. When `expected_version` is given, a mismatch against
    /// the entity's current version is reported as a commit conflict
    ///.
    pub async fn update<F>(
        &self,
        ns: &str,
        id: &str,
        schema: &Schema,
        bloom_columns: &[&str],
        expected_version: Option<u64>,
        mut apply: F,
    ) -> Result<Option<Value>>
    where
        F: FnMut(&Value) -> Result<Value>,
    {
        let mut result_entity: Option<Value> = None;
        let version = self
            .commit_replanned(ns, "update", |read_version| {
                let result_entity = &mut result_entity;
                async move {
                    let entries = table::list_commit_entries(self.store.as_ref(), ns, Some(read_version)).await?;
                    let paths = table::live_files(&entries);
                    let Some((file, idx)) = table::find_entity_file(&self.store, &paths, id).await? else {
                        return Ok(None);
                    };
                    let old_row = file.rows[idx].clone();
                    let old_entity = if schema.is_data_variant() {
                        reconstruct_entity(&old_row)
                    } else {
                        old_row.clone()
                    };

                    if let Some(expected) = expected_version {
                        let actual = old_entity.get("version").and_then(Value::as_u64).unwrap_or(0);
                        if actual != expected {
                            return Err(Error::commit_conflict(ns, 0));
                        }
                    }

                    let mut new_entity = apply(&old_entity)?;
                    let new_version = old_entity.get("version").and_then(Value::as_u64).unwrap_or(0) + 1;
                    if let Value::Object(map) = &mut new_entity {
                        map.insert("version".to_string(), Value::from(new_version));
                        map.insert("$id".to_string(), Value::String(id.to_string()));
                    }

                    let mut remaining_rows = file.rows.clone();
                    remaining_rows.remove(idx);

                    let mut adds = Vec::new();
                    if !remaining_rows.is_empty() {
                        adds.push(self.stage_file(ns, schema, &remaining_rows, bloom_columns).await?);
                    }
                    let new_row = shred_entity(&new_entity, schema);
                    adds.push(self.stage_file(ns, schema, &[new_row], bloom_columns).await?);

                    let removes = vec![RemoveAction {
                        path: file.path.clone(),
                        modification_time: now_millis(),
                        data_change: true,
                    }];
                    let staged_paths = adds.iter().map(|a| a.path.clone()).collect();

                    *result_entity = Some(new_entity);
                    Ok(Some(CommitPlan { adds, removes, staged_paths }))
                }
            })
            .await?;

        Ok(version.and(result_entity))
    }

    /// Soft-delete: flags the entity via `apply` (typically setting a
    /// `deleted: true` marker) rather than removing its row; physical
    /// removal is `hard`.
    pub async fn delete(
        &self,
        ns: &str,
        id: &str,
        schema: &Schema,
        bloom_columns: &[&str],
        hard: bool,
    ) -> Result<bool> {
        if !hard {
            let updated = self
                .update(ns, id, schema, bloom_columns, None, |entity| {
                    let mut entity = entity.clone();
                    if let Value::Object(map) = &mut entity {
                        map.insert("deleted".to_string(), Value::Bool(true));
                    }
                    Ok(entity)
                })
                .await?;
            return Ok(updated.is_some());
        }

        let deleted_count = self
            .hard_delete_entities(ns, schema, bloom_columns, |value| {
                value.get("$id").and_then(Value::as_str) == Some(id)
            })
            .await?;
        Ok(deleted_count > 0)
    }

    /// Physically rewrites every live file containing an entity matching
    /// `predicate`, dropping those rows.
    pub async fn hard_delete_entities<P>(
        &self,
        ns: &str,
        schema: &Schema,
        bloom_columns: &[&str],
        predicate: P,
    ) -> Result<usize>
    where
        P: Fn(&Value) -> bool + Copy,
    {
        let mut deleted_total = 0usize;
        let version = self
            .commit_replanned(ns, "hardDelete", |read_version| {
                let deleted_total = &mut deleted_total;
                async move {
                    let entries = table::list_commit_entries(self.store.as_ref(), ns, Some(read_version)).await?;
                    let paths = table::live_files(&entries);
                    let files = table::read_live_files(&self.store, &paths).await?;

                    let mut adds = Vec::new();
                    let mut removes = Vec::new();
                    let mut matched = 0usize;

                    for file in files {
                        let kept: Vec<Value> = file
                            .rows
                            .iter()
                            .filter(|row| {
                                let entity = if schema.is_data_variant() { reconstruct_entity(row) } else { (*row).clone() };
                                if predicate(&entity) {
                                    matched += 1;
                                    false
                                } else {
                                    true
                                }
                            })
                            .cloned()
                            .collect();

                        if kept.len() == file.rows.len() {
                            continue;
                        }
                        removes.push(RemoveAction {
                            path: file.path.clone(),
                            modification_time: now_millis(),
                            data_change: true,
                        });
                        if !kept.is_empty() {
                            adds.push(self.stage_file(ns, schema, &kept, bloom_columns).await?);
                        }
                    }

                    if removes.is_empty() {
                        return Ok(None);
                    }
                    *deleted_total = matched;
                    let staged_paths = adds.iter().map(|a| a.path.clone()).collect();
                    Ok(Some(CommitPlan { adds, removes, staged_paths }))
                }
            })
            .await?;

        Ok(if version.is_some() { deleted_total } else { 0 })
    }

    /// Compacts small files into fewer, target-sized files. `read_version`
    /// is captured once at the start of planning (see DESIGN.md's Open
    /// Question resolution) rather than re-read on every retry.
    pub async fn compact(
        &self,
        ns: &str,
        schema: &Schema,
        bloom_columns: &[&str],
        target_file_size: u64,
        min_file_size: u64,
    ) -> Result<Option<u64>> {
        let read_version = self.current_version(ns).await?;
        let entries = table::list_commit_entries(self.store.as_ref(), ns, Some(read_version)).await?;
        let paths = table::live_files(&entries);

        let mut small_files = Vec::new();
        for path in &paths {
            let head = self.store.head(path).await?;
            if head.size <= min_file_size {
                small_files.push(path.clone());
            }
        }
        if small_files.len() < 2 {
            return Ok(None);
        }

        let mut all_rows = Vec::new();
        for path in &small_files {
            let bytes = self.store.get(path).await?;
            all_rows.extend(read_all(bytes)?);
        }

        let mut adds = Vec::new();
        let mut batch = Vec::new();
        let mut batch_size_estimate = 0u64;
        for row in all_rows {
            let row_estimate = serde_json::to_vec(&row).map(|b| b.len() as u64).unwrap_or(256);
            if !batch.is_empty() && batch_size_estimate + row_estimate > target_file_size {
                adds.push(self.stage_file(ns, schema, &batch, bloom_columns).await?);
                batch.clear();
                batch_size_estimate = 0;
            }
            batch_size_estimate += row_estimate;
            batch.push(row);
        }
        if !batch.is_empty() {
            adds.push(self.stage_file(ns, schema, &batch, bloom_columns).await?);
        }

        let removes = small_files
            .iter()
            .map(|path| RemoveAction { path: path.clone(), modification_time: now_millis(), data_change: false })
            .collect();
        let staged_paths = adds.iter().map(|a| a.path.clone()).collect();
        let plan = CommitPlan { adds, removes, staged_paths };
        self.commit_blind(ns, "compact", plan).await.map(Some)
    }
}
