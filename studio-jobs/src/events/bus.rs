//! Synchronous in-process event bus for job lifecycle events.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error};

use super::job_events::{JobEvent, JobEventKind};

/// Receiver of job events.
///
/// Handlers run on the publisher's thread. A handler that owns UI state must
/// re-dispatch to its own thread instead of touching that state directly.
pub trait JobEventHandler: Send + Sync {
    fn handle(&self, event: &JobEvent);
}

impl<F> JobEventHandler for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn handle(&self, event: &JobEvent) {
        self(event)
    }
}

/// Token returned by the subscribe methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum HandlerRef {
    Strong(Arc<dyn JobEventHandler>),
    Weak(Weak<dyn JobEventHandler>),
}

impl HandlerRef {
    fn upgrade(&self) -> Option<Arc<dyn JobEventHandler>> {
        match self {
            HandlerRef::Strong(handler) => Some(handler.clone()),
            HandlerRef::Weak(handler) => handler.upgrade(),
        }
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    kind: Option<JobEventKind>,
    handler: HandlerRef,
}

/// Thread-safe publish/subscribe hub.
///
/// - `publish` copies the matching handlers under the lock and calls them
///   outside of it, so handlers may subscribe or unsubscribe re-entrantly.
/// - A panicking handler is logged and does not prevent delivery to the rest.
/// - Weak subscriptions whose owner was dropped are pruned on publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event kind, holding the handler strongly.
    pub fn subscribe(&self, kind: JobEventKind, handler: Arc<dyn JobEventHandler>) -> SubscriptionId {
        self.add(Some(kind), HandlerRef::Strong(handler))
    }

    /// Subscribe to every event kind, holding the handler strongly.
    pub fn subscribe_all(&self, handler: Arc<dyn JobEventHandler>) -> SubscriptionId {
        self.add(None, HandlerRef::Strong(handler))
    }

    /// Subscribe to a single event kind without keeping `handler` alive.
    pub fn subscribe_weak<H>(&self, kind: JobEventKind, handler: &Arc<H>) -> SubscriptionId
    where
        H: JobEventHandler + 'static,
    {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn JobEventHandler> = weak;
        self.add(Some(kind), HandlerRef::Weak(weak))
    }

    /// Subscribe to every event kind without keeping `handler` alive.
    pub fn subscribe_all_weak<H>(&self, handler: &Arc<H>) -> SubscriptionId
    where
        H: JobEventHandler + 'static,
    {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn JobEventHandler> = weak;
        self.add(None, HandlerRef::Weak(weak))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every matching subscriber on the calling thread.
    pub fn publish(&self, event: &JobEvent) {
        let kind = event.kind();
        let matching: Vec<Subscriber> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind))
                .cloned()
                .collect()
        };

        let mut dead = Vec::new();
        for subscriber in matching {
            let Some(handler) = subscriber.handler.upgrade() else {
                dead.push(subscriber.id);
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            if outcome.is_err() {
                error!(
                    job_id = %event.job_id,
                    event_kind = ?kind,
                    "Event handler panicked"
                );
            }
        }

        if !dead.is_empty() {
            debug!(count = dead.len(), "Pruning dropped weak subscriptions");
            self.subscribers.write().retain(|s| !dead.contains(&s.id));
        }
    }

    /// Number of live registrations (including weak ones not yet pruned).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Remove all subscriptions.
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }

    fn add(&self, kind: Option<JobEventKind>, handler: HandlerRef) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber { id, kind, handler });
        id
    }
}
