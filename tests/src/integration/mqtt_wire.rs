//! # MQTT Wire Subscriptions
//!
//! One wire subscription per distinct filter, no matter how many local
//! handlers share it, observed through the recording transport.

#[cfg(test)]
mod tests {
    use crate::integration::support::{collect, counter, forward, mqtt_loopback};
    use event_broker::mqtt::mocks::WireOp;
    use event_broker::{BrokerError, Context, EventBroker, EventBrokerExt, QoS};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_shared_filter_opens_and_closes_wire_once() {
        let (broker, wire) = mqtt_loopback();
        let ctx = Context::background();

        let mut subs = Vec::new();
        for _ in 0..3 {
            let (h, _) = counter();
            subs.push(broker.subscribe(&ctx, "user.*", h).await.unwrap());
        }
        assert_eq!(wire.subscribes("user/+"), 1);

        let last = subs.pop().unwrap();
        for sub in subs {
            sub.unsubscribe().await.unwrap();
        }
        assert_eq!(wire.unsubscribes("user/+"), 0);

        last.unsubscribe().await.unwrap();
        assert_eq!(wire.unsubscribes("user/+"), 1);

        // A fresh subscriber reopens the filter.
        let (h, _) = counter();
        let _again = broker.subscribe(&ctx, "user.*", h).await.unwrap();
        assert_eq!(wire.subscribes("user/+"), 2);
    }

    #[tokio::test]
    async fn test_distinct_patterns_get_distinct_filters() {
        let (broker, wire) = mqtt_loopback();
        let ctx = Context::background();
        let (h1, _) = counter();
        let (h2, _) = counter();
        let (h3, _) = counter();

        let _a = broker.subscribe(&ctx, "sensor.*.temp", h1).await.unwrap();
        let _b = broker.subscribe(&ctx, "sensor.#", h2).await.unwrap();
        let _c = broker.subscribe(&ctx, "sensor.7.temp", h3).await.unwrap();

        let subscribed: Vec<_> = wire
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                WireOp::Subscribe(filter, qos) => Some((filter, qos)),
                _ => None,
            })
            .collect();
        assert_eq!(
            subscribed,
            vec![
                ("sensor/+/temp".to_string(), QoS::AtLeastOnce),
                ("sensor/#".to_string(), QoS::AtLeastOnce),
                ("sensor/7/temp".to_string(), QoS::AtLeastOnce),
            ]
        );
    }

    #[tokio::test]
    async fn test_overlapping_filters_each_deliver() {
        let (broker, _wire) = mqtt_loopback();
        let ctx = Context::background();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _wide = broker.subscribe(&ctx, "sensor.#", forward(tx.clone())).await.unwrap();
        let _narrow = broker.subscribe(&ctx, "sensor.*.temp", forward(tx)).await.unwrap();

        broker.publish(&ctx, "sensor.7.temp", "21.5").await.unwrap();
        assert_eq!(collect(&mut rx, 2).await, vec!["21.5", "21.5"]);
    }

    #[tokio::test]
    async fn test_rejected_patterns_never_touch_the_wire() {
        let (broker, wire) = mqtt_loopback();
        let ctx = Context::background();

        for pattern in ["a.#.b", "a/b", "a.+"] {
            let (h, _) = counter();
            assert!(
                matches!(
                    broker.subscribe(&ctx, pattern, h).await,
                    Err(BrokerError::InvalidPattern { .. })
                ),
                "{pattern}"
            );
        }
        assert!(matches!(
            broker.publish(&ctx, "a.*", &1).await,
            Err(BrokerError::InvalidPattern { .. })
        ));
        assert!(wire.ops().is_empty());
        assert_eq!(broker.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_wire_failure_leaves_no_local_handler() {
        let (broker, wire) = mqtt_loopback();
        let ctx = Context::background();

        wire.fail_next_subscribe();
        let (h, count) = counter();
        assert!(matches!(
            broker.subscribe(&ctx, "orders.*", h).await,
            Err(BrokerError::Transport(_))
        ));
        assert_eq!(broker.stats().subscriptions, 0);

        broker.publish(&ctx, "orders.new", &1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*count.lock(), 0);

        // The filter is not considered open; the next subscriber retries it.
        let (h, _) = counter();
        let _sub = broker.subscribe(&ctx, "orders.*", h).await.unwrap();
        assert_eq!(wire.subscribes("orders/+"), 2);
    }

    #[tokio::test]
    async fn test_close_skips_unsubscribe_and_disconnects_once() {
        let (broker, wire) = mqtt_loopback();
        let ctx = Context::background();
        let (h, _) = counter();
        let sub = broker.subscribe(&ctx, "x.y", h).await.unwrap();

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        sub.unsubscribe().await.unwrap();

        let ops = wire.ops();
        assert_eq!(ops.iter().filter(|op| **op == WireOp::Disconnect).count(), 1);
        assert_eq!(wire.unsubscribes("x/y"), 0);
    }
}
