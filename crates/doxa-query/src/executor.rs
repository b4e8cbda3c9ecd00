//! Query executor: index selection, scan, projection,
//! sort, limit, and MV dispatch.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use doxa_common::config::CacheConfig;
use doxa_common::error::Result;
use doxa_common::types::Schema;
use doxa_commit::table;
use doxa_filter::matches as filter_matches;
use doxa_index::{IndexKey, IndexKind, RangeQuery, SecondaryIndex};
use doxa_storage::cache::{CachedReader, ReadOptions};
use doxa_storage::columnar;
use doxa_storage::columnar::data_variant::{get_data_variant_columns, reconstruct_entity};
use doxa_storage::objectstore::ObjectStore;

use crate::index_registry::IndexRegistry;
use crate::router::{self, MvMetadataProvider};

/// Sort/limit/projection options for a single `execute` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// `(field, direction)` pairs; `1` ascending, `-1` descending, applied
    /// in order.
    pub sort: Vec<(String, i32)>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub project: Option<Vec<String>>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub index_used: Option<String>,
    pub rows_scanned: usize,
    pub rows_returned: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub stats: QueryStats,
}

/// Consults the MV router, then registered indexes and the cached columnar
/// read path for the scan, applying the steps below in order.
pub struct QueryExecutor {
    store: Arc<dyn ObjectStore>,
    cache_config: CacheConfig,
    readers: DashMap<String, Arc<CachedReader>>,
    indexes: Arc<IndexRegistry>,
    mv_provider: Arc<dyn MvMetadataProvider>,
}

impl QueryExecutor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache_config: CacheConfig,
        indexes: Arc<IndexRegistry>,
        mv_provider: Arc<dyn MvMetadataProvider>,
    ) -> Self {
        Self {
            store,
            cache_config,
            readers: DashMap::new(),
            indexes,
            mv_provider,
        }
    }

    fn reader_for(&self, ns: &str) -> Arc<CachedReader> {
        self.readers
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(CachedReader::new(self.store.clone(), ns, self.cache_config.clone())))
            .clone()
    }

    pub async fn execute(
        &self,
        ns: &str,
        filter: &Value,
        schema: &Schema,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        if let Some(plan) = router::route(self.mv_provider.as_ref(), ns, filter, options) {
            let mv_filter = plan.post_filter.clone().unwrap_or_else(|| Value::Object(Default::default()));
            match self.scan(&plan.mv_name, &mv_filter, schema, options).await {
                Ok(mut result) => {
                    result.stats.index_used = Some(format!("mv:{}", plan.mv_name));
                    return Ok(result);
                }
                Err(e) => {
                    tracing::warn!(error = %e, mv = %plan.mv_name, "mv read failed, falling back to source");
                }
            }
        }
        self.scan(ns, filter, schema, options).await
    }

    /// The non-MV scan path: index narrowing, projected read, in-memory
    /// filter, then sort/skip/limit.
    async fn scan(&self, ns: &str, filter: &Value, schema: &Schema, options: &QueryOptions) -> Result<QueryResult> {
        let probes = extract_probes(filter);
        let (index_used, candidate_ids) = self.candidate_doc_ids(ns, &probes);

        let entries = table::list_commit_entries(self.store.as_ref(), ns, None).await?;
        let paths = table::live_files(&entries);

        let projection = self.projection_for(schema, options);
        let reader = self.reader_for(ns);

        let mut rows_scanned = 0usize;
        let mut matched = Vec::new();

        for path in &paths {
            let bytes = reader.read_parquet(path, ReadOptions::default()).await?;
            let file_meta = columnar::read_metadata(bytes.clone())?;
            let row_group_ids = prune_row_groups(&file_meta, &bytes, &probes);
            let projection_refs: Option<Vec<&str>> = projection.as_ref().map(|cols| cols.iter().map(String::as_str).collect());
            let file_rows = columnar::read_rowgroups(bytes, &row_group_ids, projection_refs.as_deref())?;
            rows_scanned += file_rows.len();

            for row in file_rows {
                let entity = if schema.is_data_variant() { reconstruct_entity(&row) } else { row };

                if let Some(ids) = &candidate_ids {
                    let id = entity.get("$id").and_then(Value::as_str).unwrap_or("");
                    if !ids.contains(id) {
                        continue;
                    }
                }

                if filter_matches(&entity, filter)? {
                    matched.push(project_fields(entity, options.project.as_deref()));
                }
            }
        }

        sort_rows(&mut matched, &options.sort);
        let total_matched = matched.len();
        let skip = options.skip.unwrap_or(0);
        let rows: Vec<Value> = match options.limit {
            Some(limit) => matched.into_iter().skip(skip).take(limit).collect(),
            None => matched.into_iter().skip(skip).collect(),
        };

        Ok(QueryResult {
            stats: QueryStats {
                index_used,
                rows_scanned,
                rows_returned: rows.len().max(0).min(total_matched),
            },
            rows,
        })
    }

    /// Derives the column projection to read from disk: the caller's
    /// `project` list when given, else `[$id, $data]` for a `$data`-variant
    /// schema, else every declared column.
    fn projection_for(&self, schema: &Schema, options: &QueryOptions) -> Option<Vec<String>> {
        if schema.is_data_variant() {
            let extra: Vec<&str> = options
                .project
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .filter(|c| c.as_str() != "$id" && c.as_str() != "$data")
                .map(String::as_str)
                .collect();
            get_data_variant_columns(schema, &extra)
        } else {
            options.project.clone()
        }
    }

    /// Computes the candidate doc-id set from every equality/range
    /// predicate on an indexed field, intersecting across predicates.
    /// Returns `None` when no registered index applies — meaning every
    /// live row is a candidate.
    fn candidate_doc_ids(&self, ns: &str, probes: &[(String, IndexProbe)]) -> (Option<String>, Option<HashSet<String>>) {
        let mut index_used = None;
        let mut candidates: Option<HashSet<String>> = None;

        for (field, probe) in probes {
            let Some((name, index)) = self.indexes.get(ns, field) else {
                continue;
            };
            let doc_ids: HashSet<String> = match probe {
                IndexProbe::Eq(key) => index.lookup(key).doc_ids.into_iter().collect(),
                IndexProbe::In(keys) => index.lookup_in(keys).doc_ids.into_iter().collect(),
                IndexProbe::Range(range) => index.range(range).doc_ids.into_iter().collect(),
            };
            if index_used.is_none() {
                index_used = Some(name);
            }
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&doc_ids).cloned().collect(),
                None => doc_ids,
            });
        }

        (index_used, candidates)
    }
}

enum IndexProbe {
    Eq(IndexKey),
    In(Vec<IndexKey>),
    Range(RangeQuery),
}

/// Skips row groups that a bloom filter or min/max statistics prove cannot
/// contain a match for any extracted probe. A row group survives unless some
/// probe can positively rule it out; missing stats or an unsupported key
/// shape always means "keep" — this narrows the projected read, it must
/// never produce a false negative.
fn prune_row_groups(meta: &columnar::FileMetadata, bytes: &Bytes, probes: &[(String, IndexProbe)]) -> Vec<usize> {
    if meta.row_groups.is_empty() {
        return vec![0];
    }
    (0..meta.row_groups.len())
        .filter(|&rg_id| row_group_may_match(meta, bytes, rg_id, probes))
        .collect()
}

fn row_group_may_match(meta: &columnar::FileMetadata, bytes: &Bytes, rg_id: usize, probes: &[(String, IndexProbe)]) -> bool {
    let columns = &meta.row_groups[rg_id].columns;
    for (field, probe) in probes {
        let Some(stats) = columns.iter().find(|c| &c.name == field) else {
            continue;
        };
        if stats_exclude(probe, stats) {
            return false;
        }
        if bloom_excludes(bytes, rg_id, field, probe) {
            return false;
        }
    }
    true
}

/// Min/max-based elimination: a row group can be skipped only when every
/// candidate value for `probe` falls strictly outside `[stats.min, stats.max]`.
fn stats_exclude(probe: &IndexProbe, stats: &columnar::ColumnStats) -> bool {
    let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
        return false;
    };
    let (Ok(Some(min_key)), Ok(Some(max_key))) = (IndexKey::from_value(min), IndexKey::from_value(max)) else {
        return false;
    };

    match probe {
        IndexProbe::Eq(key) => *key < min_key || *key > max_key,
        IndexProbe::In(keys) => keys.iter().all(|key| *key < min_key || *key > max_key),
        IndexProbe::Range(range) => {
            let lower_excludes = if let Some(gt) = &range.gt {
                max_key <= *gt
            } else if let Some(gte) = &range.gte {
                max_key < *gte
            } else {
                false
            };
            let upper_excludes = if let Some(lt) = &range.lt {
                min_key >= *lt
            } else if let Some(lte) = &range.lte {
                min_key > *lte
            } else {
                false
            };
            lower_excludes || upper_excludes
        }
    }
}

/// Bloom-filter-based elimination for point/`$in` probes on a bloom-enabled
/// column; ranges can't be tested against a membership filter, so they're
/// left to min/max pruning.
fn bloom_excludes(bytes: &Bytes, rg_id: usize, field: &str, probe: &IndexProbe) -> bool {
    let candidates: Vec<&IndexKey> = match probe {
        IndexProbe::Eq(key) => vec![key],
        IndexProbe::In(keys) => keys.iter().collect(),
        IndexProbe::Range(_) => return false,
    };
    let Ok(Some(bloom)) = columnar::get_bloom_filter(bytes.clone(), rg_id, field) else {
        return false;
    };
    candidates.into_iter().all(|key| !bloom_may_contain(&bloom, key))
}

fn bloom_may_contain(bloom: &columnar::BloomFilter, key: &IndexKey) -> bool {
    match key {
        IndexKey::Str(s) => bloom.might_contain_str(s),
        IndexKey::Num(n) if n.0.fract() == 0.0 => bloom.might_contain_i64(n.0 as i64),
        _ => true,
    }
}

/// Extracts top-level equality/range predicates that could be served by a
/// registered index. Predicates nested under `$and`/`$or`/`$not` are not
/// considered for indexing (they still apply correctly in the in-memory
/// filter pass; this only affects pruning, never correctness).
fn extract_probes(filter: &Value) -> Vec<(String, IndexProbe)> {
    let mut probes = Vec::new();
    let Value::Object(map) = filter else {
        return probes;
    };

    for (key, value) in map {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                if let Some(arg) = ops.get("$eq") {
                    if let Ok(Some(k)) = IndexKey::from_value(arg) {
                        probes.push((key.clone(), IndexProbe::Eq(k)));
                    }
                }
                if let Some(Value::Array(arr)) = ops.get("$in") {
                    let keys: Vec<IndexKey> = arr.iter().filter_map(|v| IndexKey::from_value(v).ok().flatten()).collect();
                    if !keys.is_empty() {
                        probes.push((key.clone(), IndexProbe::In(keys)));
                    }
                }
                let mut range = RangeQuery::default();
                let mut has_range = false;
                if let Some(arg) = ops.get("$gt") {
                    if let Ok(Some(k)) = IndexKey::from_value(arg) {
                        range.gt = Some(k);
                        has_range = true;
                    }
                }
                if let Some(arg) = ops.get("$gte") {
                    if let Ok(Some(k)) = IndexKey::from_value(arg) {
                        range.gte = Some(k);
                        has_range = true;
                    }
                }
                if let Some(arg) = ops.get("$lt") {
                    if let Ok(Some(k)) = IndexKey::from_value(arg) {
                        range.lt = Some(k);
                        has_range = true;
                    }
                }
                if let Some(arg) = ops.get("$lte") {
                    if let Ok(Some(k)) = IndexKey::from_value(arg) {
                        range.lte = Some(k);
                        has_range = true;
                    }
                }
                if has_range {
                    probes.push((key.clone(), IndexProbe::Range(range)));
                }
            }
            _ => {
                if let Ok(Some(k)) = IndexKey::from_value(value) {
                    probes.push((key.clone(), IndexProbe::Eq(k)));
                }
            }
        }
    }

    probes
}

/// Restricts `entity` to `$id` plus the fields named in `project`, if
/// given. `None` returns the entity unchanged.
fn project_fields(entity: Value, project: Option<&[String]>) -> Value {
    let Some(fields) = project else {
        return entity;
    };
    let Value::Object(map) = entity else {
        return entity;
    };
    let mut projected = serde_json::Map::new();
    if let Some(id) = map.get("$id") {
        projected.insert("$id".to_string(), id.clone());
    }
    for field in fields {
        if field == "$id" {
            continue;
        }
        if let Some(v) = map.get(field) {
            projected.insert(field.clone(), v.clone());
        }
    }
    Value::Object(projected)
}

/// Sorts `rows` by the declared `(field, direction)` keys, `1` ascending
/// and `-1` descending, applied left to right.
fn sort_rows(rows: &mut [Value], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for (field, direction) in sort {
            let va = doxa_filter::get_path(a, field);
            let vb = doxa_filter::get_path(b, field);
            let ord = compare_sortable(va, vb);
            let ord = if *direction < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Orders sort keys with missing/null sorting before any present value,
/// matching typical MongoDB-style ascending null-first semantics.
fn compare_sortable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
