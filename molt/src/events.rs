use std::sync::Arc;

use parking_lot::Mutex;

/// A service event describing the outcome of one reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    pub success: bool,
    pub error: Option<String>,
}

impl ReloadEvent {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

/// Observers outside the isolate see exactly one event per reload: either
/// a success event or an error event carrying the first diagnostic.
pub trait EventSink {
    fn reload_event(&mut self, event: ReloadEvent);
}

/// Discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn reload_event(&mut self, _event: ReloadEvent) {}
}

/// Collects events; clones share the same buffer so a test can keep a
/// handle while the isolate owns the sink.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ReloadEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReloadEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn reload_event(&mut self, event: ReloadEvent) {
        self.events.lock().push(event);
    }
}
