//! MV handler contract: a named consumer of events from one or
//! more source namespaces.

use async_trait::async_trait;

use doxa_common::error::Result;
use doxa_common::types::Event;

/// A materialized-view maintainer driven by commit events. `process` is
/// called with one batch at a time; batches for the same handler are never
/// run concurrently.
#[async_trait]
pub trait MvHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Namespace prefixes this handler is interested in. An event routes to
    /// this handler iff its target namespace starts with one of these.
    fn source_namespaces(&self) -> &[String];

    async fn process(&self, events: &[Event]) -> Result<()>;
}

/// True iff `namespace` matches one of `prefixes` by prefix.
pub fn matches_source(namespace: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| namespace.starts_with(p.as_str()))
}
