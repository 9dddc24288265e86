//! # Subject-Based Broker
//!
//! NATS over async-nats. The client reconnects on its own and is safe for
//! concurrent use, so there is no shared channel state: each `subscribe`
//! opens one native subscription, and unsubscribing cancels exactly that one.
//!
//! Closing drains: every subscription stops receiving, delivers what is
//! already buffered (bounded by the drain timeout), pending publishes are
//! flushed, then the connection is released.

use crate::config::{NatsAuth, NatsConfig};
use crate::consumer::{
    drain_buffered, pump, ConsumerSet, ConsumerTask, PumpExit, StopMode, StopUnsubscribe,
};
use crate::context::Context;
use crate::contract::{Backend, EventBroker, EventHandler, Subscription};
use crate::delivery;
use crate::error::{BrokerError, Result};
use crate::payload::{Payload, CONTENT_TYPE};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::topic;
use async_nats::{Client, ConnectOptions, HeaderMap, Message, ServerAddr};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Inner {
    client: RwLock<Option<Client>>,
    consumers: Arc<ConsumerSet>,
    stats: Arc<BrokerStats>,
    drain_timeout: Duration,
    closed: AtomicBool,
}

/// Subject-based broker.
#[derive(Clone)]
pub struct NatsBroker {
    inner: Arc<Inner>,
}

impl NatsBroker {
    /// Connect using `config`.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        config.validate()?;
        let addrs = config
            .urls
            .iter()
            .map(|url| {
                url.parse::<ServerAddr>()
                    .map_err(|e| BrokerError::Config(format!("nats url '{url}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let options = connect_options(config).await?;
        let client = options
            .connect(addrs.as_slice())
            .await
            .map_err(BrokerError::connection)?;
        info!(servers = addrs.len(), "NATS connected");
        Ok(Self::from_client(client, config.drain_timeout))
    }

    /// Build on an existing client.
    pub fn from_client(client: Client, drain_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: RwLock::new(Some(client)),
                consumers: Arc::new(ConsumerSet::new()),
                stats: Arc::new(BrokerStats::default()),
                drain_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether [`EventBroker::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn client(&self) -> Result<Client> {
        self.inner.client.read().clone().ok_or(BrokerError::Closed)
    }
}

async fn connect_options(config: &NatsConfig) -> Result<ConnectOptions> {
    let reconnect_wait = config.reconnect_wait;
    let mut options = ConnectOptions::new()
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_attempts| reconnect_wait);

    if let Some(name) = &config.name {
        options = options.name(name);
    }
    if let Some(timeout) = config.connection_timeout {
        options = options.connection_timeout(timeout);
    }

    options = match &config.auth {
        NatsAuth::None => options,
        NatsAuth::Basic { username, password } => {
            options.user_and_password(username.clone(), password.clone())
        }
        NatsAuth::Token { token } => options.token(token.clone()),
        NatsAuth::Nkey { seed } => options.nkey(seed.clone()),
        NatsAuth::CredentialsFile { path } => options
            .credentials_file(path.clone())
            .await
            .map_err(|e| BrokerError::Config(format!("{}: {e}", path.display())))?,
    };

    let tls = &config.tls;
    if tls.required {
        options = options.require_tls(true);
    }
    for root in &tls.root_certificates {
        options = options.add_root_certificates(root.clone());
    }
    if let (Some(cert), Some(key)) = (&tls.client_certificate, &tls.client_key) {
        options = options.add_client_certificate(cert.clone(), key.clone());
    }
    Ok(options)
}

#[async_trait]
impl EventBroker for NatsBroker {
    fn backend(&self) -> Backend {
        Backend::Nats
    }

    async fn publish_payload(&self, ctx: &Context, event: &str, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let client = self.client()?;
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", CONTENT_TYPE);

        ctx.run(async {
            client
                .publish_with_headers(event.to_string(), headers, payload.into_bytes())
                .await
                .map_err(BrokerError::transport)
        })
        .await?;
        self.inner.stats.record_publish();
        debug!(event = event, "Event published");
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
        let subject = topic::nats_subject(pattern)?;
        let client = self.client()?;
        let mut subscriber = ctx
            .run(async {
                client
                    .subscribe(subject.clone())
                    .await
                    .map_err(BrokerError::transport)
            })
            .await?;

        let inner = &self.inner;
        let id = inner.consumers.next_id();
        let stats = Arc::clone(&inner.stats);
        let drain_timeout = inner.drain_timeout;
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let task = ConsumerTask::spawn(move |mut stop| async move {
            let mut deliver = |message: Message| {
                let payload = Payload::from(message.payload);
                delivery::invoke(&handler, payload, &stats, &message.subject, id);
            };

            let exit = pump(&mut subscriber, &mut stop, &Context::background(), &mut deliver).await;
            let mut outcome = Ok(());
            if let PumpExit::Stopped(mode) = exit {
                outcome = subscriber
                    .unsubscribe()
                    .await
                    .map_err(BrokerError::transport);
                if mode == StopMode::Drain
                    && !drain_buffered(&mut subscriber, &mut deliver, drain_timeout).await
                {
                    warn!(subject = %subject, "Drain timed out; buffered messages dropped");
                }
            }
            debug!(subject = %subject, exit = ?exit, "NATS consumer finished");
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
        self.inner.consumers.drain_all().await;

        let client = self.inner.client.write().take();
        let flushed = match client {
            Some(client) => client.flush().await.map_err(BrokerError::transport),
            None => Ok(()),
        };
        debug!("NATS broker closed");
        flushed
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.consumers.len())
    }
}
