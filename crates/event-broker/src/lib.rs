//! # Event Broker
//!
//! Publish/subscribe over five interchangeable transports behind one
//! contract: publish an event name with a payload, subscribe a handler to
//! a pattern, close.
//!
//! ## Event names and patterns
//!
//! Event names are dot-separated tokens (`user.created`). Patterns add two
//! wildcards: `*` matches exactly one token, `#` matches zero or more
//! trailing tokens (`logs.#` matches `logs` and `logs.error.db`).
//!
//! ## Backends
//!
//! | Backend | Feature | Matching | Wire subscriptions |
//! |---------|---------|----------|--------------------|
//! | [`MemoryBroker`] | always | local | none |
//! | [`MqttBroker`] | `mqtt` | server (`/`, `+`, `#`) + local fan-out | one per filter, ref-counted |
//! | `AmqpBroker` | `amqp` | topic exchange | one queue per subscribe |
//! | `RedisBroker` | `redis` | server glob (see [`topic::redis_pattern`]) | one PSUBSCRIBE per subscribe |
//! | `NatsBroker` | `nats` | server (`*`, `>`) | one per subscribe |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use event_broker::{connect, handler, BrokerConfig, Context, EventBrokerExt};
//!
//! let broker = connect(&BrokerConfig::from_env()?).await?;
//! let ctx = Context::background();
//!
//! let sub = broker
//!     .subscribe(&ctx, "user.*", handler(|payload| {
//!         let user: User = match payload.decode() { Ok(u) => u, Err(_) => return };
//!         println!("{}", user.email);
//!     }))
//!     .await?;
//!
//! broker.publish(&ctx, "user.created", &user).await?;
//! sub.unsubscribe().await?;
//! broker.close().await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod context;
pub mod contract;
pub mod error;
pub mod memory;
pub mod mqtt;
pub mod pattern;
pub mod payload;
pub mod stats;
pub mod topic;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;

mod consumer;
mod delivery;
mod registry;

pub use config::{
    AmqpConfig, BrokerConfig, MqttConfig, NatsAuth, NatsConfig, NatsTls, RedisConfig,
};
pub use context::{CancelHandle, Context};
pub use contract::{
    handler, Backend, EventBroker, EventBrokerExt, EventHandler, HandlerId, Subscription,
};
pub use error::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use mqtt::{MqttBroker, MqttRouter, MqttTransport, QoS};
pub use pattern::matches;
pub use payload::Payload;
pub use stats::StatsSnapshot;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

use std::sync::Arc;

/// Build the broker described by `config`.
///
/// Fails with [`BrokerError::Config`] when the backend's cargo feature is
/// not enabled, and with [`BrokerError::Connection`] when the transport is
/// unreachable. No partially connected broker is ever returned.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn EventBroker>> {
    config.validate()?;
    tracing::debug!(backend = %config.backend(), "Connecting event broker");

    match config {
        BrokerConfig::Memory => Ok(Arc::new(MemoryBroker::new())),

        #[cfg(feature = "mqtt")]
        BrokerConfig::Mqtt(c) => Ok(Arc::new(MqttBroker::connect(c).await?)),
        #[cfg(feature = "amqp")]
        BrokerConfig::Amqp(c) => Ok(Arc::new(AmqpBroker::connect(c).await?)),
        #[cfg(feature = "redis")]
        BrokerConfig::Redis(c) => Ok(Arc::new(RedisBroker::connect(c).await?)),
        #[cfg(feature = "nats")]
        BrokerConfig::Nats(c) => Ok(Arc::new(NatsBroker::connect(c).await?)),

        #[allow(unreachable_patterns)]
        other => Err(BrokerError::Config(format!(
            "backend '{}' requires the `{}` cargo feature",
            other.backend(),
            other.backend()
        ))),
    }
}
