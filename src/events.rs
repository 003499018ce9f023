//! Synchronous publish/subscribe for bridge lifecycle events.
//!
//! Handlers run on the publishing task, in subscription order. A handler
//! that returns an error or panics is logged and skipped; the remaining
//! handlers still receive the event. Delivery is fire-and-forget.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProtocolNegotiated,
    MessageSent,
    MessageReceived,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BridgeEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver an event to every handler subscribed to its kind.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.kind == event.kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::error!("Event handler for {:?} failed: {:#}", event.kind, e);
                }
                Err(_) => {
                    tracing::error!("Event handler for {:?} panicked", event.kind);
                }
            }
        }
        delivered
    }

    pub fn emit(&self, kind: EventKind, payload: Value) -> usize {
        self.publish(BridgeEvent::new(kind, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_delivery_in_subscription_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe(EventKind::MessageSent, move |_| {
                seen.lock().push(label);
                Ok(())
            });
        }

        assert_eq!(dispatcher.emit(EventKind::MessageSent, json!({})), 3);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_kind_receives() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        dispatcher.subscribe(EventKind::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.emit(EventKind::MessageReceived, json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        dispatcher.emit(EventKind::Error, json!({"error": "boom"}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let dispatcher = EventDispatcher::new();
        let reached = Arc::new(AtomicU64::new(0));

        dispatcher.subscribe(EventKind::ProtocolNegotiated, |_| anyhow::bail!("handler error"));
        dispatcher.subscribe(EventKind::ProtocolNegotiated, |_| panic!("handler panic"));
        let r = Arc::clone(&reached);
        dispatcher.subscribe(EventKind::ProtocolNegotiated, move |event| {
            assert_eq!(event.payload["id"], "p1");
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivered = dispatcher.emit(EventKind::ProtocolNegotiated, json!({"id": "p1"}));
        assert_eq!(delivered, 1);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe(EventKind::MessageSent, |_| Ok(()));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.emit(EventKind::MessageSent, json!({})), 0);
    }
}
