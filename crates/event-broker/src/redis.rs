//! # Generic Pub/Sub Broker
//!
//! Redis PUBLISH / PSUBSCRIBE. Each subscription holds its own pub/sub
//! connection with one pattern subscription, consumed by a background task.
//!
//! Redis globs are not token-aware: `*` matches across dots and `#`
//! collapses to `*`. See [`crate::topic::redis_pattern`].

use crate::config::RedisConfig;
use crate::consumer::{pump, ConsumerSet, ConsumerTask, StopUnsubscribe};
use crate::context::Context;
use crate::contract::{Backend, EventBroker, EventHandler, Subscription};
use crate::delivery;
use crate::error::{BrokerError, Result};
use crate::payload::Payload;
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::topic;
use async_trait::async_trait;
use parking_lot::Mutex;
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct Inner {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    consumers: Arc<ConsumerSet>,
    stats: Arc<BrokerStats>,
    closed: AtomicBool,
}

/// Generic pub/sub broker.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<Inner>,
}

impl RedisBroker {
    /// Connect using `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.url.as_str()).map_err(BrokerError::connection)?;
        let broker = Self::from_client(client).await?;
        info!("Redis connected");
        Ok(broker)
    }

    /// Build on an existing client; opens the shared publish connection.
    pub async fn from_client(client: Client) -> Result<Self> {
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::connection)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                connection: Mutex::new(Some(connection)),
                consumers: Arc::new(ConsumerSet::new()),
                stats: Arc::new(BrokerStats::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Whether [`EventBroker::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.inner.connection.lock().clone().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl EventBroker for RedisBroker {
    fn backend(&self) -> Backend {
        Backend::Redis
    }

    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let mut connection = self.connection()?;
        let receivers: i64 = ctx
            .run(async {
                connection
                    .publish::<_, _, i64>(event, payload.as_bytes())
                    .await
                    .map_err(BrokerError::transport)
            })
            .await?;
        self.inner.stats.record_publish();
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
        let glob = topic::redis_pattern(pattern);
        let inner = &self.inner;

        let mut pubsub = ctx
            .run(async {
                let mut pubsub = inner
                    .client
                    .get_async_pubsub()
                    .await
                    .map_err(BrokerError::transport)?;
                pubsub
                    .psubscribe(glob.as_str())
                    .await
                    .map_err(BrokerError::transport)?;
                Ok::<_, BrokerError>(pubsub)
            })
            .await?;

        let id = inner.consumers.next_id();
        let stats = Arc::clone(&inner.stats);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = ConsumerTask::spawn(move |mut stop| async move {
            {
                let mut messages = Box::pin(pubsub.on_message());
                let exit = pump(&mut messages, &mut stop, &Context::background(), |msg| {
                    let payload = Payload::from_bytes(msg.get_payload_bytes().to_vec());
                    delivery::invoke(&handler, payload, &stats, msg.get_channel_name(), id);
                })
                .await;
                debug!(pattern = %glob, exit = ?exit, "Redis consumer finished");
            }
            let outcome = pubsub
                .punsubscribe(glob.as_str())
                .await
                .map_err(BrokerError::transport);
            let _ = outcome_tx.send(outcome);
        });
        inner.consumers.insert(id, task);
        debug!(pattern = pattern, handler_id = id, "Subscribed");

        Ok(Subscription::new(
            pattern,
            id,
            StopUnsubscribe::new(Arc::clone(&inner.consumers), id, outcome_rx),
        ))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.connection.lock().take();
        self.inner.consumers.stop_all().await;
        debug!("Redis broker closed");
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.consumers.len())
    }
}
