//! # Broker Contract
//!
//! The three-operation surface every backend implements: publish,
//! subscribe, close. Callers hold an `Arc<dyn EventBroker>` and never see
//! the wire format.

use crate::context::Context;
use crate::error::Result;
use crate::payload::Payload;
use crate::stats::StatsSnapshot;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Callback invoked once per matching delivery.
///
/// Handlers run on broker-owned tasks and should be quick. A panic is
/// caught at the dispatch boundary and only counted as a failure.
pub type EventHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Broker-scoped handler identifier.
pub type HandlerId = u64;

/// Wrap a closure as an [`EventHandler`].
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(Payload) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Mqtt,
    Amqp,
    Redis,
    Nats,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Memory,
        Backend::Mqtt,
        Backend::Amqp,
        Backend::Redis,
        Backend::Nats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Mqtt => "mqtt",
            Backend::Amqp => "amqp",
            Backend::Redis => "redis",
            Backend::Nats => "nats",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = crate::error::BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Backend::ALL
            .into_iter()
            .find(|backend| backend.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::error::BrokerError::Config(format!("unknown backend '{s}'")))
    }
}

/// Publish/subscribe broker.
///
/// All methods are safe to call concurrently. After [`close`](Self::close)
/// every `publish` and `subscribe` fails with `BrokerError::Closed`.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Which transport this broker runs on.
    fn backend(&self) -> Backend;

    /// Send an already-encoded payload under `event`.
    ///
    /// Returns once the transport accepted the message. Never waits for
    /// handlers to run.
    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()>;

    /// Register `handler` for every event matching `pattern`.
    async fn subscribe(&self, ctx: &Context, pattern: &str, handler: EventHandler)
        -> Result<Subscription>;

    /// Release the transport. Call once.
    async fn close(&self) -> Result<()>;

    /// Counter snapshot.
    fn stats(&self) -> StatsSnapshot;
}

/// Typed publishing on top of [`EventBroker`].
pub trait EventBrokerExt: EventBroker {
    /// Encode `payload` and publish it under `event`.
    ///
    /// Encoding happens before the returned future is first polled.
    fn publish<'a, T>(
        &'a self,
        ctx: &'a Context,
        event: &'a str,
        payload: &T,
    ) -> BoxFuture<'a, Result<()>>
    where
        T: Serialize + ?Sized,
    {
        match Payload::encode(payload) {
            Ok(payload) => self.publish_payload(ctx, event, payload),
            Err(err) => futures::future::ready(Err(err)).boxed(),
        }
    }
}

impl<B: EventBroker + ?Sized> EventBrokerExt for B {}

/// Backend-specific removal of one subscription.
#[async_trait]
pub(crate) trait Unsubscribe: Send + Sync {
    async fn unsubscribe(&self) -> Result<()>;
}

/// Handle to one registered handler.
///
/// Dropping the handle keeps the handler registered until the broker is
/// closed; call [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping a Subscription keeps the handler registered"]
pub struct Subscription {
    pattern: String,
    id: HandlerId,
    inner: Box<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(pattern: &str, id: HandlerId, inner: impl Unsubscribe + 'static) -> Self {
        Self {
            pattern: pattern.to_string(),
            id,
            inner: Box::new(inner),
        }
    }

    /// The pattern as passed to `subscribe`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler, closing the wire subscription if it was the last.
    ///
    /// Local state is cleaned up even when the transport call fails.
    pub async fn unsubscribe(self) -> Result<()> {
        self.inner.unsubscribe().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("id", &self.id)
            .finish()
    }
}
