//! Scenario 7: pushing events faster than a slow handler can
//! drain them trips back-pressure, and every event is still eventually
//! processed exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use doxa_common::config::{StreamingConfig, StreamingRetryConfig};
use doxa_common::error::Result;
use doxa_common::types::{Event, EventOp};
use doxa_streaming::{MvHandler, StreamingEngine};

struct SlowHandler {
    namespaces: Vec<String>,
    seen: Mutex<Vec<String>>,
    processed_count: AtomicUsize,
}

#[async_trait]
impl MvHandler for SlowHandler {
    fn name(&self) -> &str {
        "slow-handler"
    }

    fn source_namespaces(&self) -> &[String] {
        &self.namespaces
    }

    async fn process(&self, events: &[Event]) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut seen = self.seen.lock();
        for event in events {
            seen.push(event.id.clone());
        }
        self.processed_count.fetch_add(events.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn backpressure_trips_and_every_event_is_processed_exactly_once() {
    let config = StreamingConfig {
        batch_size: 5,
        batch_timeout_ms: 20,
        max_buffer_size: 10,
        retry: StreamingRetryConfig::default(),
    };
    let engine = Arc::new(StreamingEngine::new(config));

    let handler = Arc::new(SlowHandler {
        namespaces: vec!["orders".to_string()],
        seen: Mutex::new(Vec::new()),
        processed_count: AtomicUsize::new(0),
    });
    engine.register_handler(handler.clone()).unwrap();
    engine.start().await.unwrap();

    for i in 0..20 {
        let event = Event {
            id: format!("evt-{i}"),
            timestamp: i as i64,
            op: EventOp::Create,
            target: format!("orders:{i}"),
            before: None,
            after: None,
            actor: None,
        };
        engine.process_event(event).await.unwrap();
    }

    engine.flush().await.unwrap();
    engine.stop().await.unwrap();

    let stats = engine.get_stats();
    assert!(stats.backpressure_events > 0, "pushing 20 events into a buffer of 10 should trip back-pressure");

    let seen = handler.seen.lock();
    assert_eq!(seen.len(), 20, "every event must be processed exactly once");
    assert_eq!(handler.processed_count.load(Ordering::SeqCst), 20);
    let mut unique: Vec<&String> = seen.iter().collect();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20);
}
