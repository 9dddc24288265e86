//! # Topic-Exchange Broker
//!
//! AMQP 0-9-1 over lapin. Publishing goes through one dedicated channel
//! guarded by a lock. Each subscription gets its own channel and an
//! exclusive, auto-deleted queue bound to a durable topic exchange; the
//! exchange does the pattern matching, so patterns are used verbatim as
//! binding keys.

use crate::config::AmqpConfig;
use crate::consumer::{pump, ConsumerSet, ConsumerTask};
use crate::context::Context;
use crate::contract::{Backend, EventBroker, EventHandler, HandlerId, Subscription, Unsubscribe};
use crate::delivery;
use crate::error::{BrokerError, Result};
use crate::payload::{Payload, CONTENT_TYPE};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::topic;
use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REPLY_SUCCESS: u16 = 200;

struct Inner {
    connection: Connection,
    /// lapin channels must not be used for concurrent publishes.
    publisher: Mutex<Channel>,
    exchange: String,
    consumers: ConsumerSet,
    stats: Arc<BrokerStats>,
    closed: AtomicBool,
}

/// Topic-exchange broker.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<Inner>,
}

impl AmqpBroker {
    /// Connect, open the publish channel and declare the exchange.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        config.validate()?;
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::connection)?;
        let broker = Self::from_connection(connection, &config.exchange).await?;
        info!(exchange = %config.exchange, "AMQP connected");
        Ok(broker)
    }

    /// Build on an existing connection.
    pub async fn from_connection(connection: Connection, exchange: &str) -> Result<Self> {
        let publisher = connection
            .create_channel()
            .await
            .map_err(BrokerError::connection)?;
        declare_exchange(&publisher, exchange).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                publisher: Mutex::new(publisher),
                exchange: exchange.to_string(),
                consumers: ConsumerSet::new(),
                stats: Arc::new(BrokerStats::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Topic exchange every event is published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Whether [`EventBroker::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::connection)
}

#[async_trait]
impl EventBroker for AmqpBroker {
    fn backend(&self) -> Backend {
        Backend::Amqp
    }

    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let inner = &self.inner;

        ctx.run(async {
            let channel = inner.publisher.lock().await;
            channel
                .basic_publish(
                    &inner.exchange,
                    event,
                    BasicPublishOptions::default(),
                    payload.as_bytes(),
                    BasicProperties::default().with_content_type(CONTENT_TYPE.into()),
                )
                .await
                .map_err(BrokerError::transport)?
                .await
                .map_err(BrokerError::transport)?;
            Ok::<(), BrokerError>(())
        })
        .await?;

        inner.stats.record_publish();
        debug!(event = event, exchange = %inner.exchange, "Event published");
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
        let inner = &self.inner;
        let binding_key = topic::amqp_binding_key(pattern);

        let channel = ctx
            .run(async {
                inner
                    .connection
                    .create_channel()
                    .await
                    .map_err(BrokerError::transport)
            })
            .await?;

        let consumer = ctx.run(open_consumer(&channel, &inner.exchange, binding_key)).await;
        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(err) => {
                if let Err(close_err) = channel.close(REPLY_SUCCESS, "subscribe failed").await {
                    debug!(error = %close_err, "Closing abandoned channel failed");
                }
                return Err(err);
            }
        };

        let id = inner.consumers.next_id();
        let stats = Arc::clone(&inner.stats);
        let consume_ctx = ctx.clone();
        let label = pattern.to_string();
        let task = ConsumerTask::spawn(move |mut stop| async move {
            let mut consumer = consumer;
            let exit = pump(&mut consumer, &mut stop, &consume_ctx, |message| match message {
                Ok(message) => {
                    let payload = Payload::from(message.data);
                    delivery::invoke(&handler, payload, &stats, &label, id);
                }
                Err(err) => warn!(pattern = %label, error = %err, "AMQP delivery error"),
            })
            .await;
            debug!(pattern = %label, exit = ?exit, "AMQP consumer finished");
        });
        inner.consumers.insert(id, task);
        debug!(pattern = pattern, handler_id = id, "Subscribed");

        Ok(Subscription::new(
            pattern,
            id,
            AmqpUnsubscribe {
                inner: Arc::clone(inner),
                channel,
                id,
            },
        ))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let publisher = self.inner.publisher.lock().await;
        let channel_result = publisher
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(BrokerError::transport);
        let connection_result = self
            .inner
            .connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(BrokerError::transport);
        // Closing the connection ends every consumer stream.
        self.inner.consumers.stop_all().await;
        debug!("AMQP broker closed");
        channel_result.and(connection_result)
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.consumers.len())
    }
}

async fn open_consumer(
    channel: &Channel,
    exchange: &str,
    binding_key: &str,
) -> Result<lapin::Consumer> {
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::transport)?;

    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::transport)?;

    channel
        .basic_consume(
            queue.name().as_str(),
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::transport)
}

struct AmqpUnsubscribe {
    inner: Arc<Inner>,
    channel: Channel,
    id: HandlerId,
}

#[async_trait]
impl Unsubscribe for AmqpUnsubscribe {
    async fn unsubscribe(&self) -> Result<()> {
        let closed = if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "unsubscribe")
                .await
                .map_err(BrokerError::transport)
        } else {
            Ok(())
        };
        // The stream ends with the channel; stop covers a channel that failed to close.
        if let Some(task) = self.inner.consumers.take(self.id) {
            task.stop().await;
        }
        debug!(handler_id = self.id, "Unsubscribed");
        closed
    }
}
