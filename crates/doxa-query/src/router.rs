//! MV router & metadata. Given `(ns, filter, options)`,
//! chooses zero-or-one registered materialized view to serve the query.

use dashmap::DashMap;
use serde_json::Value;

use doxa_common::types::{MvDefinition, MvMetadata, StalenessState};

use crate::executor::QueryOptions;

/// A routing decision: read from `mv_name` instead of the source
/// namespace, applying whatever residual filter/sort/limit the MV's own
/// definition didn't already cover.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub mv_name: String,
    pub post_filter: Option<Value>,
    pub post_sort: Option<Vec<(String, i32)>>,
    pub post_limit: Option<usize>,
}

/// Registry of materialized-view metadata consulted by the router.
pub trait MvMetadataProvider: Send + Sync {
    fn register_mv(&self, meta: MvMetadata);
    fn get(&self, name: &str) -> Option<MvMetadata>;
    fn list(&self) -> Vec<MvMetadata>;
    fn clear(&self);
}

/// A minimal in-memory registry keyed by MV name.
#[derive(Default)]
pub struct InMemoryMvMetadataProvider {
    views: DashMap<String, MvMetadata>,
}

impl InMemoryMvMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MvMetadataProvider for InMemoryMvMetadataProvider {
    fn register_mv(&self, meta: MvMetadata) {
        self.views.insert(meta.name.clone(), meta);
    }

    fn get(&self, name: &str) -> Option<MvMetadata> {
        self.views.get(name).map(|e| e.value().clone())
    }

    fn list(&self) -> Vec<MvMetadata> {
        self.views.iter().map(|e| e.value().clone()).collect()
    }

    fn clear(&self) {
        self.views.clear();
    }
}

/// True iff the MV's own filter is a prefix of the query filter: every
/// top-level field/value pair in `mv_filter` also appears, identically, in
/// `query_filter`. This is the "query can be expressed as MV-filter +
/// residual" check; it intentionally does not attempt general boolean
/// subsumption, only an exact top-level-clause match.
fn mv_filter_is_consistent(mv_filter: &Value, query_filter: &Value) -> bool {
    let (Value::Object(mv_map), Value::Object(query_map)) = (mv_filter, query_filter) else {
        return false;
    };
    mv_map.iter().all(|(k, v)| query_map.get(k) == Some(v))
}

/// True iff `mv_filter` and `query_filter` are exactly equal, meaning the
/// MV already contains exactly the rows the query wants with no residual
/// filter needed.
fn mv_filter_is_exact(mv_filter: &Value, query_filter: &Value) -> bool {
    mv_filter == query_filter
}

/// The residual filter the caller must still apply after reading from the
/// MV: the query's filter with every key the MV's own filter already
/// covers removed. `None` when nothing remains.
fn residual_filter(mv_filter: Option<&Value>, query_filter: &Value) -> Option<Value> {
    let Value::Object(query_map) = query_filter else {
        return Some(query_filter.clone());
    };
    let Some(Value::Object(mv_map)) = mv_filter else {
        return Some(query_filter.clone());
    };
    let residual: serde_json::Map<String, Value> = query_map
        .iter()
        .filter(|(k, v)| mv_map.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if residual.is_empty() {
        None
    } else {
        Some(Value::Object(residual))
    }
}

struct Candidate {
    meta: MvMetadata,
    exact_match: bool,
}

/// Chooses the best MV to serve `(ns, filter, options)`, applying the
/// disqualifiers and preference order below. A row query (no
/// `groupBy`/`compute` on the query side) never routes to an aggregation MV.
pub fn route(
    provider: &dyn MvMetadataProvider,
    ns: &str,
    filter: &Value,
    _options: &QueryOptions,
) -> Option<RoutePlan> {
    let candidates: Vec<Candidate> = provider
        .list()
        .into_iter()
        .filter(|meta| meta.definition.from == ns)
        .filter(|meta| !disqualified(&meta.definition, meta, filter))
        .map(|meta| {
            let exact_match = meta
                .definition
                .filter
                .as_ref()
                .is_some_and(|mv_filter| mv_filter_is_exact(mv_filter, filter));
            Candidate { meta, exact_match }
        })
        .collect();

    let best = candidates.into_iter().min_by(|a, b| {
        // 1. Exact filter match over MVs needing post-filter.
        b.exact_match
            .cmp(&a.exact_match)
            // 2. fresh over usable-but-stale.
            .then_with(|| rank_staleness(&a.meta).cmp(&rank_staleness(&b.meta)))
            // 3. Smaller known rowCount when otherwise tied.
            .then_with(|| row_count_key(&a.meta).cmp(&row_count_key(&b.meta)))
    })?;

    let mv_filter = best.meta.definition.filter.as_ref();
    Some(RoutePlan {
        mv_name: best.meta.name.clone(),
        post_filter: residual_filter(mv_filter, filter),
        post_sort: None,
        post_limit: None,
    })
}

fn rank_staleness(meta: &MvMetadata) -> u8 {
    match meta.staleness_state {
        StalenessState::Fresh => 0,
        StalenessState::Stale => 1,
        StalenessState::Invalid => 2,
    }
}

fn row_count_key(meta: &MvMetadata) -> u64 {
    meta.row_count.unwrap_or(u64::MAX)
}

fn disqualified(definition: &MvDefinition, meta: &MvMetadata, query_filter: &Value) -> bool {
    if definition.is_aggregation() {
        return true;
    }
    if meta.staleness_state != StalenessState::Fresh && !meta.usable {
        return true;
    }
    match &definition.filter {
        Some(mv_filter) => !mv_filter_is_consistent(mv_filter, query_filter),
        None => false,
    }
}
