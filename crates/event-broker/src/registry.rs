//! # Subscription Registry
//!
//! `topic -> {handler id -> handler}` plus, for ref-counted transports,
//! whether the wire subscription for the topic is open.
//!
//! The registry is owned by exactly one broker. Reads (one per inbound
//! message) vastly outnumber writes, so it sits behind a read/write lock;
//! handler ids come from a lock-free counter.

use crate::contract::{EventHandler, HandlerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct TopicEntry {
    handlers: HashMap<HandlerId, EventHandler>,
    wire_open: bool,
}

/// Result of adding a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub id: HandlerId,
    /// No wire subscription is open for the topic yet.
    pub needs_wire: bool,
}

/// Result of removing a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Removal {
    /// The handler was present.
    pub removed: bool,
    /// The topic has no handlers left and its wire subscription was open.
    pub close_wire: bool,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: RwLock<HashMap<String, TopicEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler` under `topic` with a fresh id.
    pub fn insert(&self, topic: &str, handler: EventHandler) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut topics = self.topics.write();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.handlers.insert(id, handler);
        Registration {
            id,
            needs_wire: !entry.wire_open,
        }
    }

    /// Record that the wire subscription for `topic` is open.
    pub fn mark_open(&self, topic: &str) {
        if let Some(entry) = self.topics.write().get_mut(topic) {
            entry.wire_open = true;
        }
    }

    /// Remove exactly handler `id` from `topic`; drop the entry once empty.
    pub fn remove(&self, topic: &str, id: HandlerId) -> Removal {
        let mut topics = self.topics.write();
        let Some(entry) = topics.get_mut(topic) else {
            return Removal::default();
        };
        let removed = entry.handlers.remove(&id).is_some();
        if !entry.handlers.is_empty() {
            return Removal {
                removed,
                close_wire: false,
            };
        }
        let was_open = entry.wire_open;
        topics.remove(topic);
        Removal {
            removed,
            close_wire: was_open,
        }
    }

    /// Snapshot of handlers whose topic satisfies `matches(topic)`.
    ///
    /// The lock is released before any handler runs.
    pub fn matching(&self, mut matches: impl FnMut(&str) -> bool) -> Vec<(HandlerId, EventHandler)> {
        let topics = self.topics.read();
        topics
            .iter()
            .filter(|(topic, _)| matches(topic))
            .flat_map(|(_, entry)| {
                entry
                    .handlers
                    .iter()
                    .map(|(id, handler)| (*id, handler.clone()))
            })
            .collect()
    }

    /// Topics whose wire subscription is open.
    pub fn open_topics(&self) -> Vec<String> {
        self.topics
            .read()
            .iter()
            .filter(|(_, entry)| entry.wire_open)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.topics.read().values().map(|e| e.handlers.len()).sum()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    pub fn clear(&self) {
        self.topics.write().clear();
    }
}
