//! Layer 4: local fan-out notifications.
//!
//! Changes that already passed validation are published here for UI and
//! plugin consumers. Nothing is re-validated.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// A subscriber callback.
pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Built-in notification names.
pub mod events {
    pub const CLIENT_JOINED: &str = "Client::Joined";
    pub const CLIENT_LEFT: &str = "Client::Left";
}

#[derive(Default)]
pub struct NotificationHub {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `payload` to every subscriber of `event`. Returns the number
    /// of subscribers notified.
    pub fn publish(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so subscribers can (un)subscribe while being notified.
        let targets: Vec<Subscriber> = match self.subscribers.read().get(event) {
            Some(list) => list.iter().map(|(_, s)| Arc::clone(s)).collect(),
            None => return 0,
        };
        trace!("Notifying {} subscriber(s) of {event}", targets.len());
        for subscriber in &targets {
            subscriber(payload);
        }
        targets.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.read().get(event).map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_publish_reaches_subscribers() {
        let hub = NotificationHub::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        hub.subscribe("Presence::Changed", Arc::new(move |v| sink.lock().push(v.clone())));

        let delivered = hub.publish("Presence::Changed", &json!({"online": true}));
        assert_eq!(delivered, 1);
        assert_eq!(received.lock()[0]["online"], true);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = NotificationHub::new();
        assert_eq!(hub.publish("Nobody::Listens", &json!({})), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = NotificationHub::new();
        let a = hub.subscribe("E", Arc::new(|_| {}));
        hub.subscribe("E", Arc::new(|_| {}));
        assert_eq!(hub.subscriber_count("E"), 2);

        assert!(hub.unsubscribe(a));
        assert!(!hub.unsubscribe(a));
        assert_eq!(hub.publish("E", &json!(null)), 1);
    }

    #[test]
    fn test_subscriber_may_subscribe_during_publish() {
        let hub = Arc::new(NotificationHub::new());
        let inner = Arc::clone(&hub);
        hub.subscribe(
            "E",
            Arc::new(move |_| {
                inner.subscribe("F", Arc::new(|_| {}));
            }),
        );
        hub.publish("E", &json!({}));
        assert_eq!(hub.subscriber_count("F"), 1);
    }
}
