use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Emission counters for the event bus using lock-free atomics.
///
/// All counters use `Ordering::SeqCst` so snapshot reads are coherent
/// across fields.
#[derive(Debug, Clone)]
pub struct EventBusMetrics {
    pub events_emitted: Arc<AtomicU64>,
    pub listeners_invoked: Arc<AtomicU64>,
    pub events_without_listeners: Arc<AtomicU64>,
}

impl EventBusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events_emitted: Arc::new(AtomicU64::new(0)),
            listeners_invoked: Arc::new(AtomicU64::new(0)),
            events_without_listeners: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_emission(&self, listener_count: usize) {
        self.events_emitted.fetch_add(1, Ordering::SeqCst);
        if listener_count == 0 {
            self.events_without_listeners.fetch_add(1, Ordering::SeqCst);
        } else {
            self.listeners_invoked
                .fetch_add(listener_count as u64, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_emitted: self.events_emitted.load(Ordering::SeqCst),
            listeners_invoked: self.listeners_invoked.load(Ordering::SeqCst),
            events_without_listeners: self.events_without_listeners.load(Ordering::SeqCst),
        }
    }
}

impl Default for EventBusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub events_emitted: u64,
    pub listeners_invoked: u64,
    pub events_without_listeners: u64,
}
