//! Mock MQTT transport for tests.
//!
//! Records every wire operation and can loop publishes back through a
//! router, standing in for a server with a single connected client.

use super::{MqttRouter, MqttTransport, QoS};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One recorded wire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Publish(String, QoS),
    Subscribe(String, QoS),
    Unsubscribe(String),
    Disconnect,
}

/// Transport that records calls instead of talking to a server.
#[derive(Default)]
pub struct RecordingTransport {
    ops: Mutex<Vec<WireOp>>,
    echo: Option<MqttRouter>,
    fail_subscribe: AtomicBool,
    stalled: Mutex<Option<String>>,
}

impl RecordingTransport {
    /// Record only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and deliver every publish to `router`.
    pub fn looping(router: MqttRouter) -> Self {
        Self {
            echo: Some(router),
            ..Self::default()
        }
    }

    /// Make the next wire subscribe fail.
    pub fn fail_next_subscribe(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Make every wire subscribe to `filter` hang until the caller gives up.
    pub fn stall_subscribe(&self, filter: &str) {
        *self.stalled.lock() = Some(filter.to_string());
    }

    /// Every call recorded so far, in order.
    pub fn ops(&self) -> Vec<WireOp> {
        self.ops.lock().clone()
    }

    /// Wire subscribes issued for `filter`, including failed ones.
    pub fn subscribes(&self, filter: &str) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, WireOp::Subscribe(f, _) if f == filter))
            .count()
    }

    /// Wire unsubscribes issued for `filter`.
    pub fn unsubscribes(&self, filter: &str) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, WireOp::Unsubscribe(f) if f == filter))
            .count()
    }
}

#[async_trait]
impl MqttTransport for RecordingTransport {
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.ops.lock().push(WireOp::Publish(topic.to_string(), qos));
        if let Some(router) = &self.echo {
            router.route(topic, payload);
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.ops
            .lock()
            .push(WireOp::Subscribe(filter.to_string(), qos));
        if self.fail_subscribe.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::transport("subscribe rejected"));
        }
        let stalled = self.stalled.lock().as_deref() == Some(filter);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.ops.lock().push(WireOp::Unsubscribe(filter.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.ops.lock().push(WireOp::Disconnect);
        Ok(())
    }
}
