//! The streaming refresh engine: routes commit events to
//! registered MV handlers with batching, back-pressure, retries, and
//! per-handler isolation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use doxa_common::config::StreamingConfig;
use doxa_common::error::{Error, Result};
use doxa_common::types::Event;

use crate::handler::{matches_source, MvHandler};
use crate::listeners::{ErrorListenerFn, ListenerHandle, ListenerRegistry, StreamingErrorContext, WarningListenerFn};
use crate::stats::StreamingStats;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct RunningHandler {
    source_namespaces: Vec<String>,
    mv_name: String,
    tx: mpsc::UnboundedSender<Event>,
    force_flush: Arc<Notify>,
    /// The batch currently being processed by this handler's task, if any —
    /// surfaced to the error channel if `stop()` times out before it clears.
    in_flight: Arc<SyncMutex<Option<Vec<Event>>>>,
}

struct RuntimeState {
    handlers: Vec<RunningHandler>,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared counters and signaling consulted by both `StreamingEngine`'s
/// public methods and the per-handler background tasks it spawns.
struct EngineState {
    config: StreamingConfig,
    running: AtomicBool,
    global_buffered: AtomicUsize,
    active_flushes: AtomicUsize,
    backpressure_warned: AtomicBool,
    drain_notify: Notify,
    stats: SyncMutex<StreamingStats>,
    listeners: Arc<ListenerRegistry>,
}

impl EngineState {
    fn record_dequeue(&self) {
        self.global_buffered.fetch_sub(1, Ordering::AcqRel);
        self.drain_notify.notify_waiters();
    }

    fn emit_warning(&self, message: String) {
        tracing::warn!(%message, "streaming engine warning");
        self.listeners.emit_warning(&message);
    }
}

/// Event-driven materialized-view maintenance engine. Register handlers
/// with [`StreamingEngine::register_handler`] before calling
/// [`StreamingEngine::start`]; events arrive via
/// [`StreamingEngine::process_event`].
pub struct StreamingEngine {
    config: StreamingConfig,
    definitions: SyncMutex<Vec<Arc<dyn MvHandler>>>,
    state: Arc<EngineState>,
    runtime: AsyncMutex<Option<RuntimeState>>,
}

impl StreamingEngine {
    pub fn new(config: StreamingConfig) -> Self {
        let state = Arc::new(EngineState {
            config: config.clone(),
            running: AtomicBool::new(false),
            global_buffered: AtomicUsize::new(0),
            active_flushes: AtomicUsize::new(0),
            backpressure_warned: AtomicBool::new(false),
            drain_notify: Notify::new(),
            stats: SyncMutex::new(StreamingStats::default()),
            listeners: Arc::new(ListenerRegistry::new()),
        });
        Self {
            config,
            definitions: SyncMutex::new(Vec::new()),
            state,
            runtime: AsyncMutex::new(None),
        }
    }

    /// Registers a handler. Only permitted while stopped; handlers become
    /// active on the next `start`.
    pub fn register_handler(&self, handler: Arc<dyn MvHandler>) -> Result<()> {
        if self.state.running.load(Ordering::Acquire) {
            return Err(Error::InvalidInput(
                "cannot register a handler while the streaming engine is running".to_string(),
            ));
        }
        self.definitions.lock().push(handler);
        Ok(())
    }

    /// Idempotent: starting an already-running engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.state.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut stats = self.state.stats.lock();
            if stats.started_at.is_none() {
                stats.started_at = Some(now_millis());
            }
        }

        let definitions = self.definitions.lock().clone();
        let mut handlers = Vec::with_capacity(definitions.len());
        let mut tasks = Vec::with_capacity(definitions.len());

        for def in definitions {
            let (tx, rx) = mpsc::unbounded_channel();
            let force_flush = Arc::new(Notify::new());
            let in_flight = Arc::new(SyncMutex::new(None));
            handlers.push(RunningHandler {
                source_namespaces: def.source_namespaces().to_vec(),
                mv_name: def.name().to_string(),
                tx,
                force_flush: force_flush.clone(),
                in_flight: in_flight.clone(),
            });
            let state = self.state.clone();
            let config = self.config.clone();
            tasks.push(tokio::spawn(run_handler(def, rx, force_flush, in_flight, config, state)));
        }

        *self.runtime.lock().await = Some(RuntimeState { handlers, tasks });
        Ok(())
    }

    /// Idempotent: stopping an already-stopped engine is a no-op. Awaits
    /// every handler draining its buffer, up to a bounded timeout.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with_timeout(STOP_DRAIN_TIMEOUT).await
    }

    async fn stop_with_timeout(&self, drain_timeout: Duration) -> Result<()> {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        let RuntimeState { handlers, tasks } = runtime;
        // Captured before the senders close, so a timeout below can still
        // report whichever handler was mid-flush when it expired.
        let in_flight: Vec<(String, Arc<SyncMutex<Option<Vec<Event>>>>)> = handlers
            .iter()
            .map(|h| (h.mv_name.clone(), h.in_flight.clone()))
            .collect();
        // Dropping `runtime.handlers` closes every sender, which lets each
        // handler task drain its buffer and exit.
        drop(handlers);

        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            tracing::warn!("stop timed out waiting for handlers to drain");
            for (mv_name, buffer) in in_flight {
                let Some(batch) = buffer.lock().take() else { continue };
                if batch.is_empty() {
                    continue;
                }
                let context = StreamingErrorContext { mv_name, batch };
                let error = Error::Internal(
                    "stop timed out before this handler's in-flight batch finished processing".to_string(),
                );
                self.state.listeners.emit_error(&error, &context);
            }
        }
        Ok(())
    }

    /// Accepts a single event for routing. Rejects if the engine is not
    /// running.
    pub async fn process_event(&self, event: Event) -> Result<()> {
        if !self.state.running.load(Ordering::Acquire) {
            return Err(Error::InvalidInput("streaming engine is not running".to_string()));
        }

        let runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.as_ref() else {
            return Err(Error::InvalidInput("streaming engine is not running".to_string()));
        };

        let namespace = event.namespace().to_string();
        let mut routed = 0usize;
        for handler in &runtime.handlers {
            if matches_source(&namespace, &handler.source_namespaces) {
                if handler.tx.send(event.clone()).is_ok() {
                    routed += 1;
                    self.state.global_buffered.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        drop(runtime);

        {
            let mut stats = self.state.stats.lock();
            stats.record_received(event.op, &namespace, now_millis());
        }

        self.apply_backpressure().await;
        let _ = routed;
        Ok(())
    }

    /// Back-pressure policy: warn once at ≥80% occupancy (reset on the
    /// next flush), and block the caller at 100% until a handler dequeues,
    /// counting every such wait.
    async fn apply_backpressure(&self) {
        let max = self.config.max_buffer_size;
        if max == 0 {
            return;
        }
        let warn_threshold = (max * 8) / 10;
        if self.state.global_buffered.load(Ordering::Acquire) >= warn_threshold
            && !self.state.backpressure_warned.swap(true, Ordering::AcqRel)
        {
            self.state.emit_warning("event buffer at or above 80% capacity".to_string());
        }

        while self.state.global_buffered.load(Ordering::Acquire) >= max {
            {
                let mut stats = self.state.stats.lock();
                stats.record_backpressure_event();
            }
            self.state.drain_notify.notified().await;
        }
    }

    /// Forces an immediate flush of every handler's buffer and waits for
    /// all in-flight and queued work to settle.
    pub async fn flush(&self) -> Result<()> {
        {
            let runtime = self.runtime.lock().await;
            if let Some(runtime) = runtime.as_ref() {
                for handler in &runtime.handlers {
                    handler.force_flush.notify_waiters();
                }
            }
        }
        while self.state.global_buffered.load(Ordering::Acquire) > 0 || self.is_flushing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    pub fn is_flushing(&self) -> bool {
        self.state.active_flushes.load(Ordering::Acquire) > 0
    }

    pub fn get_stats(&self) -> StreamingStats {
        self.state.stats.lock().clone()
    }

    /// Zeros every counter, preserving `started_at` while still running
    ///.
    pub fn reset_stats(&self) {
        self.state.stats.lock().reset();
    }

    pub fn on_error(&self, f: ErrorListenerFn) -> ListenerHandle {
        self.state.listeners.on_error(f)
    }

    pub fn on_warning(&self, f: WarningListenerFn) -> ListenerHandle {
        self.state.listeners.on_warning(f)
    }

    pub fn remove_all_error_listeners(&self) {
        self.state.listeners.remove_all_error_listeners();
    }

    pub fn remove_all_warning_listeners(&self) {
        self.state.listeners.remove_all_warning_listeners();
    }

    pub fn dispose(&self) {
        self.state.listeners.dispose();
    }
}

/// Per-handler background task: accumulates events until `batchSize` is
/// reached or `batchTimeoutMs` elapses since the first buffered event,
/// then flushes. Runs until its channel closes (on engine `stop`).
async fn run_handler(
    handler: Arc<dyn MvHandler>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    force_flush: Arc<Notify>,
    in_flight: Arc<SyncMutex<Option<Vec<Event>>>>,
    config: StreamingConfig,
    state: Arc<EngineState>,
) {
    let mv_name = handler.name().to_string();
    let mut buffer: Vec<Event> = Vec::new();

    loop {
        if buffer.is_empty() {
            match rx.recv().await {
                Some(event) => {
                    state.record_dequeue();
                    buffer.push(event);
                }
                None => break,
            }
        }

        let deadline = tokio::time::sleep_until(Instant::now() + Duration::from_millis(config.batch_timeout_ms));
        tokio::pin!(deadline);
        let mut channel_closed = false;

        while buffer.len() < config.batch_size {
            tokio::select! {
                biased;
                _ = force_flush.notified() => break,
                maybe = rx.recv() => {
                    match maybe {
                        Some(event) => {
                            state.record_dequeue();
                            buffer.push(event);
                        }
                        None => { channel_closed = true; break; }
                    }
                }
                _ = &mut deadline => break,
            }
        }

        let batch = std::mem::take(&mut buffer);
        if !batch.is_empty() {
            *in_flight.lock() = Some(batch.clone());
        }
        flush_batch(&handler, &mv_name, batch, &config, &state).await;
        *in_flight.lock() = None;

        if channel_closed {
            break;
        }
    }
}

async fn flush_batch(
    handler: &Arc<dyn MvHandler>,
    mv_name: &str,
    batch: Vec<Event>,
    config: &StreamingConfig,
    state: &Arc<EngineState>,
) {
    if batch.is_empty() {
        return;
    }

    state.active_flushes.fetch_add(1, Ordering::AcqRel);
    let start = std::time::Instant::now();

    let mut last_error = None;
    for attempt in 0..config.retry.max_attempts {
        match handler.process(&batch).await {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                last_error = Some(e);
                if attempt + 1 >= config.retry.max_attempts {
                    break;
                }
                let delay_ms = config
                    .retry
                    .base_delay_ms
                    .saturating_mul(1u64 << attempt.min(20))
                    .min(config.retry.max_delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match last_error {
        None => {
            let mut stats = state.stats.lock();
            stats.record_batch_success(mv_name, batch.len(), elapsed_ms);
        }
        Some(error) => {
            {
                let mut stats = state.stats.lock();
                stats.record_batch_failure(elapsed_ms);
            }
            let context = StreamingErrorContext { mv_name: mv_name.to_string(), batch };
            state.listeners.emit_error(&error, &context);
        }
    }

    state.backpressure_warned.store(false, Ordering::Release);
    state.active_flushes.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use doxa_common::types::EventOp;
    use tokio::sync::Mutex as TokioMutex;

    struct CountingHandler {
        name: String,
        sources: Vec<String>,
        received: Arc<AtomicU64>,
        batches: Arc<TokioMutex<Vec<usize>>>,
    }

    #[async_trait::async_trait]
    impl MvHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }
        fn source_namespaces(&self) -> &[String] {
            &self.sources
        }
        async fn process(&self, events: &[Event]) -> Result<()> {
            self.received.fetch_add(events.len() as u64, Ordering::Relaxed);
            self.batches.lock().await.push(events.len());
            Ok(())
        }
    }

    fn event(ns: &str, local: &str) -> Event {
        Event {
            id: format!("{ns}:{local}"),
            timestamp: 0,
            op: EventOp::Create,
            target: format!("{ns}:{local}"),
            before: None,
            after: None,
            actor: None,
        }
    }

    #[tokio::test]
    async fn events_route_by_namespace_prefix_and_flush_on_batch_size() {
        let mut config = StreamingConfig::default();
        config.batch_size = 3;
        config.batch_timeout_ms = 60_000;
        let engine = StreamingEngine::new(config);

        let received = Arc::new(AtomicU64::new(0));
        let batches = Arc::new(TokioMutex::new(Vec::new()));
        engine
            .register_handler(Arc::new(CountingHandler {
                name: "orders_mv".to_string(),
                sources: vec!["orders".to_string()],
                received: received.clone(),
                batches: batches.clone(),
            }))
            .unwrap();

        engine.start().await.unwrap();
        for i in 0..3 {
            engine.process_event(event("orders", &i.to_string())).await.unwrap();
        }
        engine.process_event(event("users", "1")).await.unwrap();

        engine.flush().await.unwrap();
        engine.stop().await.unwrap();

        assert_eq!(received.load(Ordering::Relaxed), 3);
        assert_eq!(*batches.lock().await, vec![3]);
    }

    #[tokio::test]
    async fn batch_timeout_flushes_a_partial_batch() {
        let mut config = StreamingConfig::default();
        config.batch_size = 100;
        config.batch_timeout_ms = 20;
        let engine = StreamingEngine::new(config);

        let received = Arc::new(AtomicU64::new(0));
        let batches = Arc::new(TokioMutex::new(Vec::new()));
        engine
            .register_handler(Arc::new(CountingHandler {
                name: "orders_mv".to_string(),
                sources: vec!["orders".to_string()],
                received: received.clone(),
                batches: batches.clone(),
            }))
            .unwrap();

        engine.start().await.unwrap();
        engine.process_event(event("orders", "1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await.unwrap();

        assert_eq!(received.load(Ordering::Relaxed), 1);
    }

    struct FailingHandler {
        name: String,
        sources: Vec<String>,
        attempts: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl MvHandler for FailingHandler {
        fn name(&self) -> &str {
            &self.name
        }
        fn source_namespaces(&self) -> &[String] {
            &self.sources
        }
        async fn process(&self, _events: &[Event]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(Error::Internal("handler always fails".to_string()))
        }
    }

    #[tokio::test]
    async fn exhausted_retries_record_a_failed_batch_and_notify_listeners() {
        let mut config = StreamingConfig::default();
        config.batch_size = 1;
        config.batch_timeout_ms = 50;
        config.retry.max_attempts = 3;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        let engine = StreamingEngine::new(config);

        let attempts = Arc::new(AtomicU64::new(0));
        engine
            .register_handler(Arc::new(FailingHandler {
                name: "broken_mv".to_string(),
                sources: vec!["orders".to_string()],
                attempts: attempts.clone(),
            }))
            .unwrap();

        let error_count = Arc::new(AtomicU64::new(0));
        let error_count_cb = error_count.clone();
        let _handle = engine.on_error(Arc::new(move |_err, ctx| {
            assert_eq!(ctx.mv_name, "broken_mv");
            error_count_cb.fetch_add(1, Ordering::Relaxed);
        }));

        engine.start().await.unwrap();
        engine.process_event(event("orders", "1")).await.unwrap();
        engine.flush().await.unwrap();
        engine.stop().await.unwrap();

        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert_eq!(error_count.load(Ordering::Relaxed), 1);
        assert_eq!(engine.get_stats().failed_batches, 1);
    }

    struct SlowHandler {
        name: String,
        sources: Vec<String>,
        processed: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl MvHandler for SlowHandler {
        fn name(&self) -> &str {
            &self.name
        }
        fn source_namespaces(&self) -> &[String] {
            &self.sources
        }
        async fn process(&self, events: &[Event]) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.processed.fetch_add(events.len() as u64, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn backpressure_blocks_producer_and_every_event_is_processed_once() {
        let mut config = StreamingConfig::default();
        config.batch_size = 1;
        config.batch_timeout_ms = 5;
        config.max_buffer_size = 10;
        let engine = StreamingEngine::new(config);

        let processed = Arc::new(AtomicU64::new(0));
        engine
            .register_handler(Arc::new(SlowHandler {
                name: "slow_mv".to_string(),
                sources: vec!["orders".to_string()],
                processed: processed.clone(),
            }))
            .unwrap();

        engine.start().await.unwrap();
        for i in 0..20 {
            engine.process_event(event("orders", &i.to_string())).await.unwrap();
        }
        engine.flush().await.unwrap();
        engine.stop().await.unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 20);
        assert!(engine.get_stats().backpressure_events > 0);
    }

    #[tokio::test]
    async fn process_event_rejects_when_not_running() {
        let engine = StreamingEngine::new(StreamingConfig::default());
        let err = engine.process_event(event("orders", "1")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    struct HangingHandler {
        name: String,
        sources: Vec<String>,
    }

    #[async_trait::async_trait]
    impl MvHandler for HangingHandler {
        fn name(&self) -> &str {
            &self.name
        }
        fn source_namespaces(&self) -> &[String] {
            &self.sources
        }
        async fn process(&self, _events: &[Event]) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_timeout_reports_abandoned_batch_via_error_channel() {
        let mut config = StreamingConfig::default();
        config.batch_size = 1;
        config.batch_timeout_ms = 5;
        let engine = StreamingEngine::new(config);

        engine
            .register_handler(Arc::new(HangingHandler {
                name: "stuck_mv".to_string(),
                sources: vec!["orders".to_string()],
            }))
            .unwrap();

        let reported = Arc::new(SyncMutex::new(Vec::new()));
        let reported_cb = reported.clone();
        let _handle = engine.on_error(Arc::new(move |_err, ctx| {
            reported_cb.lock().push((ctx.mv_name.clone(), ctx.batch.len()));
        }));

        engine.start().await.unwrap();
        engine.process_event(event("orders", "1")).await.unwrap();
        // give the handler task time to pick up the event and start its
        // (permanently pending) process() call before stop() races it
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.stop_with_timeout(Duration::from_millis(50)).await.unwrap();

        let calls = reported.lock();
        assert_eq!(calls.as_slice(), &[("stuck_mv".to_string(), 1)]);
    }

    #[tokio::test]
    async fn reset_stats_preserves_started_at_while_running() {
        let engine = StreamingEngine::new(StreamingConfig::default());
        engine.start().await.unwrap();
        let started = engine.get_stats().started_at;
        assert!(started.is_some());

        engine.process_event(event("orders", "1")).await.unwrap();
        engine.reset_stats();
        assert_eq!(engine.get_stats().started_at, started);
        assert_eq!(engine.get_stats().events_received, 0);
        engine.stop().await.unwrap();
    }
}
