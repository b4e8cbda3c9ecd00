//! Streaming engine statistics.

use std::collections::HashMap;

use doxa_common::types::EventOp;

/// A point-in-time snapshot of the engine's counters. `reset_stats` zeros
/// every field except `started_at`, which survives a reset while the engine
/// is still running.
#[derive(Debug, Clone, Default)]
pub struct StreamingStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_by_op: HashMap<EventOpKey, u64>,
    pub events_by_namespace: HashMap<String, u64>,
    pub events_by_mv: HashMap<String, u64>,
    pub batches_processed: u64,
    pub failed_batches: u64,
    pub backpressure_events: u64,
    pub avg_batch_processing_ms: f64,
    pub started_at: Option<i64>,
    pub last_event_at: Option<i64>,
}

/// `EventOp` doesn't derive `Hash` in `doxa-common`, so stats key on this
/// small mirror enum instead of widening that type's derives just for a
/// HashMap key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOpKey {
    Create,
    Update,
    Delete,
}

impl From<EventOp> for EventOpKey {
    fn from(op: EventOp) -> Self {
        match op {
            EventOp::Create => EventOpKey::Create,
            EventOp::Update => EventOpKey::Update,
            EventOp::Delete => EventOpKey::Delete,
        }
    }
}

impl StreamingStats {
    pub(crate) fn record_received(&mut self, op: EventOp, namespace: &str, now_millis: i64) {
        self.events_received += 1;
        *self.events_by_op.entry(op.into()).or_insert(0) += 1;
        *self.events_by_namespace.entry(namespace.to_string()).or_insert(0) += 1;
        self.last_event_at = Some(now_millis);
    }

    pub(crate) fn record_batch_success(&mut self, mv_name: &str, batch_len: usize, elapsed_ms: f64) {
        self.events_processed += batch_len as u64;
        *self.events_by_mv.entry(mv_name.to_string()).or_insert(0) += batch_len as u64;
        self.batches_processed += 1;
        self.update_avg_batch_ms(elapsed_ms);
    }

    pub(crate) fn record_batch_failure(&mut self, elapsed_ms: f64) {
        self.failed_batches += 1;
        self.update_avg_batch_ms(elapsed_ms);
    }

    fn update_avg_batch_ms(&mut self, sample_ms: f64) {
        let n = (self.batches_processed + self.failed_batches) as f64;
        if n <= 1.0 {
            self.avg_batch_processing_ms = sample_ms;
        } else {
            self.avg_batch_processing_ms += (sample_ms - self.avg_batch_processing_ms) / n;
        }
    }

    pub(crate) fn record_backpressure_event(&mut self) {
        self.backpressure_events += 1;
    }

    /// Zeros every counter. `started_at` is restored by the caller when the
    /// engine is still running.
    pub(crate) fn reset(&mut self) {
        let started_at = self.started_at;
        *self = StreamingStats::default();
        self.started_at = started_at;
    }
}
