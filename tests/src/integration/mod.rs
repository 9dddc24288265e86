//! Cross-module integration suites.

pub mod concurrency;
pub mod conformance;
pub mod mqtt_wire;

#[cfg(test)]
pub(crate) mod support {
    use event_broker::mqtt::mocks::RecordingTransport;
    use event_broker::{EventBroker, EventHandler, MemoryBroker, MqttBroker, MqttRouter, QoS};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub const WAIT: Duration = Duration::from_secs(2);
    pub const QUIET: Duration = Duration::from_millis(150);

    /// Every broker that runs without a server.
    pub fn in_process_brokers() -> Vec<Arc<dyn EventBroker>> {
        vec![Arc::new(MemoryBroker::new()), mqtt_loopback().0]
    }

    /// MQTT broker whose transport echoes publishes back through the router.
    pub fn mqtt_loopback() -> (Arc<dyn EventBroker>, Arc<RecordingTransport>) {
        let router = MqttRouter::new();
        let transport = Arc::new(RecordingTransport::looping(router.clone()));
        let broker = MqttBroker::with_transport(router, transport.clone(), QoS::AtLeastOnce);
        (Arc::new(broker), transport)
    }

    /// Handler forwarding decoded strings to a channel.
    pub fn forward(tx: mpsc::UnboundedSender<String>) -> EventHandler {
        event_broker::handler(move |payload| {
            if let Ok(value) = payload.decode::<String>() {
                let _ = tx.send(value);
            }
        })
    }

    /// Handler counting invocations.
    pub fn counter() -> (EventHandler, Arc<Mutex<usize>>) {
        let count = Arc::new(Mutex::new(0usize));
        let seen = Arc::clone(&count);
        let handler = event_broker::handler(move |_| *seen.lock() += 1);
        (handler, count)
    }

    /// Receive exactly `n` values, then assert nothing else arrives.
    pub async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            let value = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("channel closed");
            values.push(value);
        }
        let extra = tokio::time::timeout(QUIET, rx.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))), "unexpected extra delivery");
        values.sort();
        values
    }
}
