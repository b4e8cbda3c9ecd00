//! Event-driven materialized-view refresh engine for Doxa.

pub mod engine;
pub mod handler;
pub mod listeners;
pub mod stats;

pub use engine::StreamingEngine;
pub use handler::{matches_source, MvHandler};
pub use listeners::{ErrorListenerFn, ListenerHandle, ListenerRegistry, StreamingErrorContext, WarningListenerFn};
pub use stats::{EventOpKey, StreamingStats};
