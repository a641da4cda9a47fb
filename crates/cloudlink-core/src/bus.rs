// ── EventBus ──
//
// Synchronous, ordered delivery of lifecycle events to registered
// observers, plus a broadcast tap for async consumers. Injected into the
// controller and shared with its transports; there is no global instance.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::{Event, LifecycleEvent, Observer, Verdict};
use crate::transport::TransportKind;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Typed publish point for [`LifecycleEvent`]s.
///
/// Cheaply cloneable. Observers are called in registration order on the
/// emitting thread. Registration swaps in a new observer list, so an
/// observer registered while an event is being dispatched only sees
/// later events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    server_id: Arc<str>,
    observers: ArcSwap<Vec<Arc<dyn Observer>>>,
    event_tx: broadcast::Sender<Arc<Event>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("server_id", &self.inner.server_id)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(server_id: impl Into<Arc<str>>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(BusInner {
                server_id: server_id.into(),
                observers: ArcSwap::from_pointee(Vec::new()),
                event_tx,
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Append an observer.
    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.inner.observers.rcu(|current| {
            let mut next: Vec<Arc<dyn Observer>> = current.iter().cloned().collect();
            next.push(Arc::clone(&observer));
            next
        });
    }

    /// Append a closure observer.
    pub fn register_fn<F>(&self, observer: F)
    where
        F: Fn(&Event) -> Verdict + Send + Sync + 'static,
    {
        self.register(Arc::new(observer));
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.load().len()
    }

    /// Receive every delivered event asynchronously. Cannot veto.
    ///
    /// Slow receivers get [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.event_tx.subscribe()
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Deliver `kind` as raised by a `transport` transport.
    ///
    /// Returns `false` only when `kind` is cancellable and at least one
    /// observer vetoed it; every observer still sees the event. Events
    /// scoped to the other transport variant are dropped.
    pub fn emit(&self, transport: TransportKind, kind: LifecycleEvent) -> bool {
        if let Some(scope) = kind.scope() {
            if scope != transport {
                trace!(event = kind.name(), %transport, "dropping event scoped to {scope}");
                return true;
            }
        }

        let event = Event {
            transport,
            server_id: Arc::clone(&self.inner.server_id),
            timestamp: Utc::now(),
            kind,
        };

        let cancellable = event.kind.is_cancellable();
        let mut allowed = true;
        let observers = self.inner.observers.load();
        for (index, observer) in observers.iter().enumerate() {
            if observer.on_event(&event) == Verdict::Veto {
                if cancellable {
                    debug!(event = event.kind.name(), observer = index, "event vetoed");
                    allowed = false;
                } else {
                    trace!(event = event.kind.name(), "ignoring veto of non-cancellable event");
                }
            }
        }

        let _ = self.inner.event_tx.send(Arc::new(event));
        allowed
    }
}
