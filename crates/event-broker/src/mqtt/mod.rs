//! # MQTT-style Broker
//!
//! MQTT clients hold one subscription per literal filter, so the broker
//! ref-counts: the first local handler for a filter opens the wire
//! subscription, the last one to leave closes it. Every inbound message
//! goes through [`MqttRouter::route`], which matches the message topic
//! against every registered filter and fans out to local handlers.
//!
//! Overlapping filters (`a/+` and `a/#`) are separate wire subscriptions.
//! A server may deliver one message once per matching filter, in which
//! case handlers see it more than once.
//!
//! The wire protocol sits behind [`MqttTransport`]; the `mqtt` feature
//! provides the rumqttc implementation.

#[cfg(feature = "mqtt")]
mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

#[cfg(feature = "mqtt")]
pub use client::RumqttcTransport;

use crate::context::Context;
use crate::contract::{Backend, EventBroker, EventHandler, HandlerId, Subscription, Unsubscribe};
use crate::delivery::{self, InFlight};
use crate::error::{BrokerError, Result};
use crate::pattern::MQTT;
use crate::payload::Payload;
use crate::registry::SubscriptionRegistry;
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::topic;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BrokerError::Config(format!(
                "qos must be 0, 1 or 2 (got {other})"
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtLeastOnce
    }
}

/// Wire operations the broker needs from an MQTT client.
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()>;
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;
    async fn unsubscribe(&self, filter: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Single dispatch point for inbound messages.
///
/// Shared between the broker (which registers handlers) and the transport
/// (which feeds it every received PUBLISH).
#[derive(Clone, Default)]
pub struct MqttRouter {
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<BrokerStats>,
    in_flight: Arc<InFlight>,
}

impl MqttRouter {
    /// Router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan `payload` out to every handler whose filter matches `topic`.
    /// Returns the number of handlers scheduled.
    pub fn route(&self, topic: &str, payload: Bytes) -> usize {
        let _routing = self.in_flight.enter();
        let handlers = self.registry.matching(|filter| MQTT.matches(filter, topic));
        if handlers.is_empty() {
            debug!(topic = topic, "No local handler for inbound message");
            return 0;
        }
        delivery::dispatch(
            handlers,
            &Payload::from(payload),
            &self.stats,
            &self.in_flight,
            topic,
        )
    }

    /// Filters with an open wire subscription, for resubscribing after a reconnect.
    #[must_use]
    pub fn open_filters(&self) -> Vec<String> {
        self.registry.open_topics()
    }
}

/// Per-filter locks serializing wire subscribe/unsubscribe, so ref-count
/// transitions are atomic without making unrelated filters wait on each other.
#[derive(Default)]
struct WireLocks {
    locks: parking_lot::Mutex<HashMap<String, (Arc<Mutex<()>>, usize)>>,
}

impl WireLocks {
    async fn lock(&self, filter: &str) -> WireGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            let (lock, users) = locks.entry(filter.to_string()).or_default();
            *users += 1;
            Arc::clone(lock)
        };
        let mut wire = WireGuard {
            locks: self,
            filter: filter.to_string(),
            guard: None,
        };
        wire.guard = Some(lock.lock_owned().await);
        wire
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

struct WireGuard<'a> {
    locks: &'a WireLocks,
    filter: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WireGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if let Some((_, users)) = locks.get_mut(&self.filter) {
            *users -= 1;
            if *users == 0 {
                locks.remove(&self.filter);
            }
        }
    }
}

struct Inner {
    transport: Arc<dyn MqttTransport>,
    router: MqttRouter,
    qos: QoS,
    /// Held shared by subscribe/unsubscribe and exclusively by close.
    gate: RwLock<()>,
    wire: WireLocks,
    closed: AtomicBool,
}

/// MQTT-style broker over any [`MqttTransport`].
#[derive(Clone)]
pub struct MqttBroker {
    inner: Arc<Inner>,
}

impl MqttBroker {
    /// Build a broker over an existing transport already wired to `router`.
    pub fn with_transport(router: MqttRouter, transport: Arc<dyn MqttTransport>, qos: QoS) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                router,
                qos,
                gate: RwLock::new(()),
                wire: WireLocks::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect with rumqttc using `config`.
    #[cfg(feature = "mqtt")]
    pub async fn connect(config: &crate::config::MqttConfig) -> Result<Self> {
        config.validate()?;
        let router = MqttRouter::new();
        let transport = RumqttcTransport::connect(config, router.clone()).await?;
        Ok(Self::with_transport(router, Arc::new(transport), config.qos))
    }

    /// QoS used for every publish and wire subscription.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.inner.qos
    }

    /// Router shared with the transport.
    #[must_use]
    pub fn router(&self) -> &MqttRouter {
        &self.inner.router
    }

    /// Whether [`EventBroker::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventBroker for MqttBroker {
    fn backend(&self) -> Backend {
        Backend::Mqtt
    }

    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let topic = topic::mqtt_topic(event)?;
        ctx.run(self.inner.transport.publish(&topic, self.inner.qos, payload.into_bytes()))
            .await?;
        self.inner.router.stats.record_publish();
        debug!(event = event, topic = %topic, "Event published");
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
        let filter = topic::mqtt_filter(pattern)?;

        let _gate = ctx.run(async { Ok(self.inner.gate.read().await) }).await?;
        let _wire = ctx.run(async { Ok(self.inner.wire.lock(&filter).await) }).await?;
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let registry = &self.inner.router.registry;
        let registration = registry.insert(&filter, handler);
        if registration.needs_wire {
            let opened = ctx
                .run(self.inner.transport.subscribe(&filter, self.inner.qos))
                .await;
            if let Err(err) = opened {
                registry.remove(&filter, registration.id);
                if err.is_context() {
                    // the SUBSCRIBE may already have been sent
                    if let Err(undo) = self.inner.transport.unsubscribe(&filter).await {
                        warn!(filter = %filter, error = %undo, "Compensating unsubscribe failed");
                    }
                }
                warn!(pattern = pattern, filter = %filter, error = %err, "Wire subscribe failed");
                return Err(err);
            }
            registry.mark_open(&filter);
            debug!(filter = %filter, "Wire subscription opened");
        }
        debug!(pattern = pattern, handler_id = registration.id, "Subscribed");

        Ok(Subscription::new(
            pattern,
            registration.id,
            MqttUnsubscribe {
                inner: Arc::clone(&self.inner),
                filter,
                id: registration.id,
            },
        ))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _gate = self.inner.gate.write().await;
        self.inner.router.registry.clear();
        let result = self.inner.transport.disconnect().await;
        self.inner.router.in_flight.wait_idle().await;
        debug!("MQTT broker closed");
        result
    }

    fn stats(&self) -> StatsSnapshot {
        let router = &self.inner.router;
        router.stats.snapshot(router.registry.handler_count())
    }
}

struct MqttUnsubscribe {
    inner: Arc<Inner>,
    filter: String,
    id: HandlerId,
}

#[async_trait]
impl Unsubscribe for MqttUnsubscribe {
    async fn unsubscribe(&self) -> Result<()> {
        let _gate = self.inner.gate.read().await;
        let _wire = self.inner.wire.lock(&self.filter).await;
        let removal = self.inner.router.registry.remove(&self.filter, self.id);
        debug!(filter = %self.filter, handler_id = self.id, "Unsubscribed");

        if removal.close_wire && !self.inner.closed.load(Ordering::Acquire) {
            self.inner.transport.unsubscribe(&self.filter).await?;
            debug!(filter = %self.filter, "Wire subscription closed");
        }
        Ok(())
    }
}
