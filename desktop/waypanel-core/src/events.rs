//! Event Bus: topic-indexed publish/subscribe dispatched on the UI thread.
//!
//! Modules declare interest in named topics rather than matching on a
//! fixed event enum. Alongside the explicit `subscribe()` call, a handler
//! can instead carry a marker attribute and be picked up automatically by
//! the loader at `on_start` time through `EventHandlerEntry`, for modules
//! that would rather declare handlers next to the methods themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;

/// Opaque subscription id, returned by `subscribe` and required by
/// `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&Value) + Send>;

struct Subscription {
    id: SubscriptionId,
    module_id: String,
    handler: Handler,
}

/// A function pointer a module can list in a static `EVENT_HANDLERS` table
/// instead of calling `subscribe()` directly from `on_start`.
pub type EventHandlerFn = fn(&Value);

/// One row of a module's static handler table: `(topic, handler)`.
pub type EventHandlerEntry = (&'static str, EventHandlerFn);

/// Topic-indexed pub/sub. All dispatch happens synchronously on whatever
/// thread calls `publish`; callers own the invariant that this is always
/// the UI thread, per the concurrency model.
///
/// Ordering guarantees: handlers subscribed to the same topic run in
/// subscription order; across topics, publishes are delivered in the
/// global order they were enqueued (there is no cross-topic batching here
/// since `publish` dispatches inline rather than queuing, so this is
/// automatic as long as callers only ever call `publish` from the UI
/// thread).
pub struct EventBus {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `topic`, attributed to `module_id` so
    /// `unsubscribe_all` can clean it up on disable.
    pub fn subscribe<F>(&self, topic: &str, module_id: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id,
                module_id: module_id.to_string(),
                handler: Box::new(handler),
            });
        id
    }

    /// Registers every `(topic, handler)` in a module's static table, the
    /// marker-attribute convenience path.
    pub fn subscribe_all(&self, module_id: &str, entries: &[EventHandlerEntry]) {
        for (topic, handler) in entries {
            let handler = *handler;
            self.subscribe(topic, module_id, move |payload| handler(payload));
        }
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(subs) = self.subscriptions.lock().get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Removes every subscription owned by `module_id`, across all topics.
    /// Called as part of the disable sequence before tasks/threads are
    /// cancelled, so a module cannot receive events mid-teardown.
    pub fn unsubscribe_all(&self, module_id: &str) {
        let mut subs = self.subscriptions.lock();
        for handlers in subs.values_mut() {
            handlers.retain(|s| s.module_id != module_id);
        }
    }

    /// Dispatches `payload` to every handler subscribed to `topic`, in
    /// subscription order. A handler that panics is caught and logged; it
    /// does not stop delivery to the remaining handlers (per-handler
    /// isolation).
    pub fn publish(&self, topic: &str, payload: Value) {
        let mut subs = self.subscriptions.lock();
        let Some(handlers) = subs.get_mut(topic) else {
            return;
        };
        for sub in handlers.iter_mut() {
            let handler = &mut sub.handler;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&payload);
            }));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "event handler for topic '{topic}' owned by '{}' panicked: {msg}",
                    sub.module_id
                );
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .lock()
            .get(topic)
            .map_or(0, |s| s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn publish_delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe("topic", "a", move |_| o1.lock().push(1));
        let o2 = order.clone();
        bus.subscribe("topic", "b", move |_| o2.lock().push(2));

        bus.publish("topic", Value::Null);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_all_removes_only_owning_module() {
        let bus = EventBus::new();
        bus.subscribe("topic", "a", |_| {});
        bus.subscribe("topic", "b", |_| {});
        bus.unsubscribe_all("a");
        assert_eq!(bus.subscriber_count("topic"), 1);
    }

    #[test]
    fn publish_to_unknown_topic_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish("nothing-subscribed", Value::Null);
    }

    #[test]
    fn handler_panic_does_not_block_remaining_handlers() {
        let bus = EventBus::new();
        let ran = Arc::new(Mutex::new(false));
        bus.subscribe("topic", "a", |_| panic!("boom"));
        let ran2 = ran.clone();
        bus.subscribe("topic", "b", move |_| *ran2.lock() = true);
        bus.publish("topic", Value::Null);
        assert!(*ran.lock());
    }

    #[test]
    fn unsubscribe_single_subscription() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = bus.subscribe("topic", "a", move |_| *c.lock() += 1);
        bus.unsubscribe("topic", id);
        bus.publish("topic", Value::Null);
        assert_eq!(*count.lock(), 0);
    }
}
