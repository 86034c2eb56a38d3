//! Typed publish/subscribe with explicit subscriber lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use beacon_shared::{ConnectionState, EmergencyState, ProviderKind};

use crate::router::BroadcastReport;

/// Handle returned by every `subscribe`/`on_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out of `T` values to registered handlers.
///
/// Handlers run on the publishing task, outside the subscriber lock, in
/// registration order.
pub struct EventBus<T> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    pub fn publish(&self, event: &T) {
        let handlers: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Change of the active provider's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub provider: ProviderKind,
    pub state: ConnectionState,
    /// True once every tracked channel is re-joined and sends flow.
    pub ready: bool,
}

/// Emergency lifecycle events published by the coordinator.
#[derive(Debug, Clone)]
pub enum EmergencyEvent {
    Declared(EmergencyState),
    Superseded {
        previous: EmergencyState,
        current: EmergencyState,
    },
    Resolved(EmergencyState),
    /// At least one emergency channel could not be reached on any provider.
    BroadcastDegraded(BroadcastReport),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_publish_and_unsubscribe() {
        let bus: EventBus<u32> = EventBus::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        let first = bus.subscribe(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t = total.clone();
        bus.subscribe(move |v| {
            t.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        bus.publish(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish(&1);
        assert_eq!(total.load(Ordering::SeqCst), 32);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_handler_may_subscribe_reentrantly() {
        let bus: Arc<EventBus<()>> = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        bus.publish(&());
        assert_eq!(bus.len(), 2);
    }
}
