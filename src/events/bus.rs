//! Typed publish/subscribe bus for crawler lifecycle events
//!
//! Listeners are registered per `EventKind` and invoked sequentially for
//! each emission, in registration order, on a dedicated task. Emission
//! itself never blocks the caller. `wait_for_all_listeners` gives shutdown
//! paths a way to drain everything still in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::errors::EventBusError;
use super::metrics::EventBusMetrics;
use super::types::{Event, EventKind};

/// A registered event listener.
///
/// Listeners receive a clone of the event and return a future the bus
/// awaits before invoking the next listener for the same emission.
pub type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by `on()`, usable to deregister with `off()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct RegisteredListener {
    id: ListenerId,
    listener: Listener,
}

/// Process-wide event bus (see `EventKind` for the vocabulary).
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<RegisteredListener>>>,
    next_id: AtomicU64,
    /// Emissions whose listener task has not yet settled
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    shutdown_flag: AtomicBool,
    metrics: EventBusMetrics,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pending: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            shutdown_flag: AtomicBool::new(false),
            metrics: EventBusMetrics::new(),
        }
    }

    /// Register a listener for one event kind.
    ///
    /// Listeners for the same emission run sequentially in registration
    /// order; distinct emissions run on independent tasks.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(RegisteredListener { id, listener });
        id
    }

    /// Deregister a listener. Unknown ids are a no-op.
    pub fn off(&self, id: ListenerId) {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            entries.retain(|entry| entry.id != id);
        }
    }

    /// Emit an event to all listeners registered for its kind.
    ///
    /// Returns the number of listeners that will be invoked. The listener
    /// futures run on a spawned task; use `wait_for_all_listeners` to
    /// await their completion.
    pub fn emit(&self, event: Event) -> Result<usize, EventBusError> {
        if self.is_shutdown() {
            return Err(EventBusError::Shutdown);
        }

        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.read();
            listeners
                .get(&event.kind())
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
                .unwrap_or_default()
        };

        let count = snapshot.len();
        self.metrics.record_emission(count);
        if count == 0 {
            log::trace!("Emitted {:?} with no listeners", event.kind());
            return Ok(0);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let drained = Arc::clone(&self.drained);
        tokio::spawn(async move {
            for listener in snapshot {
                listener(event.clone()).await;
            }
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });

        Ok(count)
    }

    /// Wait until every listener task spawned by prior `emit` calls has
    /// settled
    pub async fn wait_for_all_listeners(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Bounded variant of `wait_for_all_listeners` for shutdown paths
    pub async fn wait_for_all_listeners_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<(), EventBusError> {
        match tokio::time::timeout(timeout, self.wait_for_all_listeners()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(EventBusError::ListenerDrainTimeout {
                pending: self.pending.load(Ordering::SeqCst),
            }),
        }
    }

    /// Number of listeners currently registered for a kind
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .get(&kind)
            .map_or(0, std::vec::Vec::len)
    }

    /// Reject further emissions. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        log::debug!("Event bus shutdown signaled");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: Arc<AtomicUsize>) -> Listener {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_emit_invokes_registered_listeners() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::PersistState, counting_listener(Arc::clone(&counter)));
        bus.on(EventKind::PersistState, counting_listener(Arc::clone(&counter)));

        let invoked = bus
            .emit(Event::PersistState { is_migrating: false })
            .expect("emit should succeed");
        assert_eq!(invoked, 2);

        bus.wait_for_all_listeners().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_without_listeners_is_ok() {
        let bus = EventBus::new();
        let invoked = bus.emit(Event::Migrating).expect("emit should succeed");
        assert_eq!(invoked, 0);
        assert_eq!(bus.metrics().snapshot().events_without_listeners, 1);
    }

    #[tokio::test]
    async fn test_off_deregisters() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.on(EventKind::Exit, counting_listener(Arc::clone(&counter)));
        bus.off(id);

        bus.emit(Event::Exit).expect("emit should succeed");
        bus.wait_for_all_listeners().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_fails() {
        let bus = EventBus::new();
        bus.shutdown();
        assert!(matches!(
            bus.emit(Event::Aborting),
            Err(EventBusError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_listeners_run_sequentially_per_emission() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            bus.on(
                EventKind::SessionRetired,
                Arc::new(move |_| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        // the second listener must observe the first's entry
                        order.lock().push(tag);
                    })
                }),
            );
        }

        bus.emit(Event::SessionRetired { session_id: "s".into() })
            .expect("emit should succeed");
        bus.wait_for_all_listeners().await;
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
