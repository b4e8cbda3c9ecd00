//! Error/warning listener registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use doxa_common::error::Error;
use doxa_common::types::Event;

/// What a failed batch's error listeners are told.
#[derive(Debug, Clone)]
pub struct StreamingErrorContext {
    pub mv_name: String,
    pub batch: Vec<Event>,
}

pub type ErrorListenerFn = Arc<dyn Fn(&Error, &StreamingErrorContext) + Send + Sync>;
pub type WarningListenerFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Error,
    Warning,
}

/// Registry shared by the engine; `on_error`/`on_warning` hand out a
/// [`ListenerHandle`] the caller can `unsubscribe()` independently of
/// `remove_all_*_listeners`.
#[derive(Default)]
pub struct ListenerRegistry {
    error_listeners: DashMap<u64, ErrorListenerFn>,
    warning_listeners: DashMap<u64, WarningListenerFn>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_error(self: &Arc<Self>, f: ErrorListenerFn) -> ListenerHandle {
        let id = self.next_id();
        self.error_listeners.insert(id, f);
        ListenerHandle { id, kind: ListenerKind::Error, registry: self.clone() }
    }

    pub fn on_warning(self: &Arc<Self>, f: WarningListenerFn) -> ListenerHandle {
        let id = self.next_id();
        self.warning_listeners.insert(id, f);
        ListenerHandle { id, kind: ListenerKind::Warning, registry: self.clone() }
    }

    pub fn remove_all_error_listeners(&self) {
        self.error_listeners.clear();
    }

    pub fn remove_all_warning_listeners(&self) {
        self.warning_listeners.clear();
    }

    pub fn dispose(&self) {
        self.remove_all_error_listeners();
        self.remove_all_warning_listeners();
    }

    pub(crate) fn emit_error(&self, error: &Error, context: &StreamingErrorContext) {
        for entry in self.error_listeners.iter() {
            (entry.value())(error, context);
        }
    }

    pub(crate) fn emit_warning(&self, message: &str) {
        for entry in self.warning_listeners.iter() {
            (entry.value())(message);
        }
    }
}

/// An unsubscribe handle returned by `on_error`/`on_warning`.
pub struct ListenerHandle {
    id: u64,
    kind: ListenerKind,
    registry: Arc<ListenerRegistry>,
}

impl ListenerHandle {
    pub fn unsubscribe(&self) {
        match self.kind {
            ListenerKind::Error => {
                self.registry.error_listeners.remove(&self.id);
            }
            ListenerKind::Warning => {
                self.registry.warning_listeners.remove(&self.id);
            }
        }
    }
}
