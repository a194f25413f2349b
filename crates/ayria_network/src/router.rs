//! Layer 2: raw message handlers keyed by topic hash.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::topic::{Topic, TopicHash};

/// A raw handler: `(timestamp, sender long id, payload) -> accepted`.
///
/// The return value only feeds diagnostics; the packet has already been
/// persisted by the time handlers run.
pub type MessageHandler = Arc<dyn Fn(u64, &str, &[u8]) -> bool + Send + Sync>;

/// Result of dispatching one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that reported the payload as successfully interpreted.
    pub accepted: usize,
}

impl DispatchOutcome {
    pub fn interpreted(&self) -> bool {
        self.accepted > 0
    }
}

/// Routes decoded payloads to every handler registered for their topic.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<TopicHash, Vec<MessageHandler>>,
}

impl MessageRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic. Several handlers may share a topic.
    pub fn register(&mut self, topic: &Topic, handler: MessageHandler) {
        debug!("Registering handler for topic {topic} ({})", topic.hash());
        self.handlers.entry(topic.hash()).or_default().push(handler);
    }

    /// Check if any handler is registered for a topic hash.
    pub fn has_handler(&self, topic: TopicHash) -> bool {
        self.handlers.contains_key(&topic)
    }

    /// Number of handlers registered for a topic hash.
    pub fn handler_count(&self, topic: TopicHash) -> usize {
        self.handlers.get(&topic).map_or(0, Vec::len)
    }

    /// Invoke every handler for `topic`.
    pub fn dispatch(&self, topic: TopicHash, timestamp: u64, sender: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(handlers) = self.handlers.get(&topic) else {
            trace!("No handler for topic {topic}");
            return DispatchOutcome::default();
        };

        let mut outcome = DispatchOutcome::default();
        for handler in handlers {
            outcome.invoked += 1;
            if handler(timestamp, sender, payload) {
                outcome.accepted += 1;
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
