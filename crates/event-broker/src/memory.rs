//! # Memory Broker
//!
//! In-process fan-out with no external resources. Every matching handler
//! runs as its own task; publish never waits for handlers, `close` does.

use crate::context::Context;
use crate::contract::{Backend, EventBroker, EventHandler, HandlerId, Subscription, Unsubscribe};
use crate::delivery::{self, InFlight};
use crate::error::{BrokerError, Result};
use crate::pattern;
use crate::payload::Payload;
use crate::registry::SubscriptionRegistry;
use crate::stats::{BrokerStats, StatsSnapshot};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Shared {
    registry: SubscriptionRegistry,
    stats: Arc<BrokerStats>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

/// In-process broker.
///
/// Patterns are matched with the canonical grammar, including the
/// terminal behavior of `#` (`a.#.b` matches like `a.#`).
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: SubscriptionRegistry::new(),
                stats: Arc::new(BrokerStats::default()),
                in_flight: Arc::new(InFlight::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether [`EventBroker::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.registry.handler_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()> {
        let _publishing = self.shared.in_flight.enter();
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        ctx.check()?;

        let handlers = self
            .shared
            .registry
            .matching(|pattern| pattern::matches(pattern, event));
        self.shared.stats.record_publish();
        let shared = &self.shared;
        let receivers =
            delivery::dispatch(handlers, &payload, &shared.stats, &shared.in_flight, event);

        debug!(event = event, receivers = receivers, "Event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<Subscription> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        ctx.check()?;

        let registration = self.shared.registry.insert(pattern, handler);
        debug!(pattern = pattern, handler_id = registration.id, "Subscribed");

        Ok(Subscription::new(
            pattern,
            registration.id,
            MemoryUnsubscribe {
                shared: Arc::clone(&self.shared),
                pattern: pattern.to_string(),
                id: registration.id,
            },
        ))
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.registry.clear();
            self.shared.in_flight.wait_idle().await;
            debug!("Memory broker closed");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.registry.handler_count())
    }
}

struct MemoryUnsubscribe {
    shared: Arc<Shared>,
    pattern: String,
    id: HandlerId,
}

#[async_trait]
impl Unsubscribe for MemoryUnsubscribe {
    async fn unsubscribe(&self) -> Result<()> {
        let removal = self.shared.registry.remove(&self.pattern, self.id);
        debug!(
            pattern = %self.pattern,
            handler_id = self.id,
            removed = removal.removed,
            "Unsubscribed"
        );
        Ok(())
    }
}
