//! rumqttc-backed [`MqttTransport`].
//!
//! The rumqttc event loop is driven by one background task that feeds
//! inbound PUBLISH packets to the [`MqttRouter`]. rumqttc reconnects on the
//! next poll after an error; the driver rotates through the configured
//! endpoints between attempts and re-issues every open subscription once
//! the new session is acknowledged, since sessions are always clean.
//!
//! A wire subscribe completes only when the server's SUBACK arrives. A
//! rejected filter (return code 0x80) is reported as an error.
//!
//! The client speaks MQTT 3.1.1, which has no message properties:
//! publishes carry the bare JSON body with no content type attached.

use super::{MqttRouter, MqttTransport, QoS};
use crate::config::MqttConfig;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, SubAck,
    SubscribeFilter, SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// How long `disconnect` waits for the event loop to flush DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Filters per SUBSCRIBE packet when restoring after a reconnect.
const RESTORE_BATCH: usize = 32;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| BrokerError::Config(format!("mqtt url '{raw}': {e}")))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            other => {
                return Err(BrokerError::Config(format!(
                    "mqtt url '{raw}': unsupported scheme '{other}'"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| BrokerError::Config(format!("mqtt url '{raw}': missing host")))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        Ok(Self { host, port, tls })
    }
}

/// Options shared by every endpoint.
#[derive(Clone)]
struct Session {
    client_id: String,
    keep_alive: Duration,
    credentials: Option<(String, String)>,
    qos: QoS,
    reconnect_delay: Duration,
}

impl Session {
    fn options(&self, endpoint: &Endpoint) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password);
        }
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

type AckSender = oneshot::Sender<Result<()>>;

/// SUBSCRIBE requests waiting for their SUBACK.
///
/// rumqttc assigns packet ids inside the event loop, so waiters are queued
/// in request order and bound to a packet id when the loop reports the
/// SUBSCRIBE as sent.
#[derive(Default)]
struct PendingAcks {
    /// Held while queueing a waiter and sending its request.
    order: tokio::sync::Mutex<()>,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    queued: VecDeque<AckSender>,
    sent: HashMap<u16, AckSender>,
}

impl PendingAcks {
    /// Queue a waiter, then `request`. Resolves once the request is queued
    /// with the client; the receiver yields the SUBACK outcome.
    async fn submit<F>(&self, request: F) -> Result<oneshot::Receiver<Result<()>>>
    where
        F: Future<Output = std::result::Result<(), ClientError>>,
    {
        let _order = self.order.lock().await;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().queued.push_back(tx);
        let mut unsent = Unsent {
            waiters: &self.waiters,
            sent: false,
        };
        request.await.map_err(BrokerError::transport)?;
        unsent.sent = true;
        Ok(rx)
    }

    fn sent(&self, pkid: u16) {
        let mut waiters = self.waiters.lock();
        if let Some(waiter) = waiters.queued.pop_front() {
            waiters.sent.insert(pkid, waiter);
        }
    }

    fn acknowledged(&self, ack: &SubAck) {
        let waiter = self.waiters.lock().sent.remove(&ack.pkid);
        if let Some(waiter) = waiter {
            let _ = waiter.send(suback_result(ack));
        }
    }

    /// Fail every waiter. Called when the session they belong to is gone.
    fn fail_all(&self, reason: &str) {
        let mut guard = self.waiters.lock();
        let waiters = &mut *guard;
        let failed = waiters.queued.len() + waiters.sent.len();
        for waiter in waiters
            .queued
            .drain(..)
            .chain(waiters.sent.drain().map(|(_, waiter)| waiter))
        {
            let _ = waiter.send(Err(BrokerError::transport(reason)));
        }
        if failed > 0 {
            debug!(count = failed, reason = reason, "Failed pending subscribes");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let waiters = self.waiters.lock();
        waiters.queued.len() + waiters.sent.len()
    }
}

/// Removes the newest queued waiter if its request never reached the
/// client, including when the submitting future is dropped.
struct Unsent<'a> {
    waiters: &'a Mutex<Waiters>,
    sent: bool,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.waiters.lock().queued.pop_back();
        }
    }
}

fn suback_result(ack: &SubAck) -> Result<()> {
    let rejected = ack
        .return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count();
    if rejected == 0 {
        Ok(())
    } else {
        Err(BrokerError::Transport(format!(
            "server rejected {rejected} of {} filters",
            ack.return_codes.len()
        )))
    }
}

async fn await_ack(ack: oneshot::Receiver<Result<()>>, wait: Duration) -> Result<()> {
    match timeout(wait, ack).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(BrokerError::transport("connection closed before SUBACK")),
        Err(_) => Err(BrokerError::Transport(format!("no SUBACK within {wait:?}"))),
    }
}

fn restore_batches(filters: Vec<String>, qos: QoS) -> Vec<Vec<SubscribeFilter>> {
    filters
        .chunks(RESTORE_BATCH)
        .map(|chunk| {
            chunk
                .iter()
                .map(|filter| SubscribeFilter::new(filter.clone(), qos.into()))
                .collect()
        })
        .collect()
}

/// MQTT transport over a rumqttc [`AsyncClient`].
pub struct RumqttcTransport {
    client: AsyncClient,
    pending: Arc<PendingAcks>,
    ack_timeout: Duration,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcTransport {
    /// Connect to the first reachable endpoint and start the event loop.
    pub async fn connect(config: &MqttConfig, router: MqttRouter) -> Result<Self> {
        let endpoints = config
            .urls
            .iter()
            .map(|raw| Endpoint::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        let session = Session {
            client_id: config
                .client_id
                .clone()
                .unwrap_or_else(|| format!("event-broker-{}", uuid::Uuid::new_v4().simple())),
            keep_alive: config.keep_alive,
            credentials: config
                .username
                .clone()
                .map(|username| (username, config.password.clone().unwrap_or_default())),
            qos: config.qos,
            reconnect_delay: config.reconnect_delay,
        };

        let mut last_error = String::from("no endpoints configured");
        for (index, endpoint) in endpoints.iter().enumerate() {
            let (client, mut eventloop) =
                AsyncClient::new(session.options(endpoint), config.channel_capacity);

            match timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await {
                Ok(Ok(())) => {
                    info!(host = %endpoint.host, port = endpoint.port, "MQTT connected");
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let pending = Arc::new(PendingAcks::default());
                    let driver = Driver {
                        client: client.clone(),
                        router,
                        endpoints: endpoints.clone(),
                        current: index,
                        session,
                        pending: Arc::clone(&pending),
                        ack_timeout: config.ack_timeout,
                        restoring: None,
                        shutdown: shutdown_rx,
                    };
                    let handle = tokio::spawn(driver.run(eventloop));
                    return Ok(Self {
                        client,
                        pending,
                        ack_timeout: config.ack_timeout,
                        shutdown,
                        driver: Mutex::new(Some(handle)),
                    });
                }
                Ok(Err(err)) => last_error = err,
                Err(_) => last_error = format!("no CONNACK within {:?}", config.connect_timeout),
            }
            warn!(host = %endpoint.host, port = endpoint.port, error = %last_error, "MQTT endpoint unavailable");
        }

        Err(BrokerError::Connection(last_error))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> std::result::Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }
}

struct Driver {
    client: AsyncClient,
    router: MqttRouter,
    endpoints: Vec<Endpoint>,
    current: usize,
    session: Session,
    pending: Arc<PendingAcks>,
    ack_timeout: Duration,
    restoring: Option<JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self, mut eventloop: EventLoop) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.router.route(&publish.topic, publish.payload);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(previous) = self.restoring.take() {
                        previous.abort();
                    }
                    self.restoring = self.resubscribe();
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.pending.sent(pkid),
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.pending.acknowledged(&ack),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("MQTT disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "MQTT connection lost");
                    self.pending.fail_all("connection lost before SUBACK");
                    if self.endpoints.len() > 1 {
                        self.current = (self.current + 1) % self.endpoints.len();
                        let endpoint = &self.endpoints[self.current];
                        info!(host = %endpoint.host, port = endpoint.port, "MQTT failing over");
                        eventloop.mqtt_options = self.session.options(endpoint);
                    }
                    tokio::select! {
                        _ = self.shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(self.session.reconnect_delay) => {}
                    }
                }
            }
        }
        if let Some(restoring) = self.restoring.take() {
            restoring.abort();
        }
        self.pending.fail_all("client stopped");
        debug!("MQTT event loop stopped");
    }

    /// Re-issue every open filter from a separate task, so the event loop
    /// keeps draining the request queue while the restore is in progress.
    fn resubscribe(&self) -> Option<JoinHandle<()>> {
        let filters = self.router.open_filters();
        if filters.is_empty() {
            return None;
        }
        debug!(count = filters.len(), "Restoring MQTT subscriptions");
        let batches = restore_batches(filters, self.session.qos);
        let client = self.client.clone();
        let pending = Arc::clone(&self.pending);
        let ack_timeout = self.ack_timeout;

        Some(tokio::spawn(async move {
            for batch in batches {
                let count = batch.len();
                let restored = match pending.submit(client.subscribe_many(batch)).await {
                    Ok(ack) => await_ack(ack, ack_timeout).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = restored {
                    warn!(count = count, error = %err, "Failed to restore MQTT subscriptions");
                }
            }
        }))
    }
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.client
            .publish_bytes(topic, qos.into(), false, payload)
            .await
            .map_err(BrokerError::transport)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let ack = self
            .pending
            .submit(self.client.subscribe(filter, qos.into()))
            .await?;
        await_ack(ack, self.ack_timeout).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(BrokerError::transport)
    }

    async fn disconnect(&self) -> Result<()> {
        let requested = self.client.disconnect().await.map_err(BrokerError::transport);
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                self.shutdown.send_replace(true);
                driver.abort();
            }
        }
        requested
    }
}
