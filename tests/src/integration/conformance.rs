//! # Broker Contract Conformance
//!
//! The same scenarios run against every broker that needs no server: the
//! memory broker and the MQTT core over a loopback transport. Anything a
//! caller can observe through `EventBroker` must behave identically.

#[cfg(test)]
mod tests {
    use crate::integration::support::{collect, counter, forward, in_process_brokers, QUIET, WAIT};
    use event_broker::{
        handler, matches, BrokerError, CancelHandle, Context, EventBroker, EventBrokerExt,
    };
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u64,
        sku: String,
        lines: Vec<u32>,
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_subscribers_each_get_one_copy() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();

            let exact = broker
                .subscribe(&ctx, "user.created", forward(tx.clone()))
                .await
                .unwrap();
            let wildcard = broker.subscribe(&ctx, "user.*", forward(tx)).await.unwrap();

            broker.publish(&ctx, "user.created", "u-1").await.unwrap();
            assert_eq!(collect(&mut rx, 2).await, vec!["u-1", "u-1"], "{}", broker.backend());

            exact.unsubscribe().await.unwrap();
            wildcard.unsubscribe().await.unwrap();
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_affects_only_its_handler() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let (quiet, quiet_count) = counter();

            let first = broker.subscribe(&ctx, "job.*", quiet).await.unwrap();
            let _second = broker.subscribe(&ctx, "job.*", forward(tx)).await.unwrap();
            first.unsubscribe().await.unwrap();

            broker.publish(&ctx, "job.done", "j-7").await.unwrap();
            assert_eq!(collect(&mut rx, 1).await, vec!["j-7"]);
            assert_eq!(*quiet_count.lock(), 0, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_no_delivery_after_last_unsubscribe() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (count_handler, count) = counter();
            let sub = broker.subscribe(&ctx, "tick", count_handler).await.unwrap();
            sub.unsubscribe().await.unwrap();

            broker.publish(&ctx, "tick", &1u8).await.unwrap();
            tokio::time::sleep(QUIET).await;
            assert_eq!(*count.lock(), 0, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_multi_level_wildcard_covers_descendants() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let _sub = broker.subscribe(&ctx, "logs.#", forward(tx)).await.unwrap();

            broker.publish(&ctx, "logs.error", "a").await.unwrap();
            broker.publish(&ctx, "logs.error.db", "b").await.unwrap();
            broker.publish(&ctx, "metrics.cpu", "c").await.unwrap();

            assert_eq!(collect(&mut rx, 2).await, vec!["a", "b"], "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_starve_others() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();

            let _bad = broker
                .subscribe(&ctx, "audit.*", handler(|_| panic!("handler bug")))
                .await
                .unwrap();
            let _good = broker.subscribe(&ctx, "audit.*", forward(tx)).await.unwrap();

            broker.publish(&ctx, "audit.login", "first").await.unwrap();
            broker.publish(&ctx, "audit.login", "second").await.unwrap();
            assert_eq!(collect(&mut rx, 2).await, vec!["first", "second"]);

            let stats = broker.stats();
            assert_eq!(stats.handler_failures, 2, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_structured_payload_round_trips() {
        let order = OrderPlaced {
            id: 42,
            sku: "widget-\u{e9}".into(),
            lines: vec![3, 1, 4],
        };
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let _sub = broker
                .subscribe(
                    &ctx,
                    "order.placed",
                    handler(move |payload| {
                        let _ = tx.send(payload.decode::<OrderPlaced>());
                    }),
                )
                .await
                .unwrap();

            broker.publish(&ctx, "order.placed", &order).await.unwrap();
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.unwrap(), order, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mismatched_decode_only_fails_that_handler() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let typed = tx.clone();
            let _numbers = broker
                .subscribe(
                    &ctx,
                    "mixed",
                    handler(move |payload| {
                        let _ = typed.send(payload.decode::<u64>().is_err().to_string());
                    }),
                )
                .await
                .unwrap();
            let _strings = broker.subscribe(&ctx, "mixed", forward(tx)).await.unwrap();

            broker.publish(&ctx, "mixed", "not-a-number").await.unwrap();
            assert_eq!(collect(&mut rx, 2).await, vec!["not-a-number", "true"]);
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_operations_after_close_fail_with_closed() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            broker.close().await.unwrap();
            broker.close().await.unwrap();

            assert!(matches!(
                broker.publish(&ctx, "any", &()).await,
                Err(BrokerError::Closed)
            ));
            let (h, _) = counter();
            assert!(matches!(
                broker.subscribe(&ctx, "any", h).await,
                Err(BrokerError::Closed)
            ));
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_publish_and_subscribe() {
        for broker in in_process_brokers() {
            let (ctx, cancel): (Context, CancelHandle) = Context::background().with_cancel();
            cancel.cancel();

            let err = broker.publish(&ctx, "x", &1).await.unwrap_err();
            assert!(err.is_context(), "{}: {err}", broker.backend());

            let (h, _) = counter();
            let err = broker.subscribe(&ctx, "x", h).await.unwrap_err();
            assert!(err.is_context(), "{}: {err}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_expired_deadline_is_reported() {
        for broker in in_process_brokers() {
            let ctx = Context::background().with_timeout(Duration::ZERO);
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(matches!(
                broker.publish(&ctx, "x", &1).await,
                Err(BrokerError::DeadlineExceeded)
            ));
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unserializable_payload_never_reaches_transport() {
        use std::collections::HashMap;

        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (h, count) = counter();
            let _sub = broker.subscribe(&ctx, "bad", h).await.unwrap();

            // JSON object keys must be strings
            let bad: HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
            assert!(matches!(
                broker.publish(&ctx, "bad", &bad).await,
                Err(BrokerError::Encode(_))
            ));
            tokio::time::sleep(QUIET).await;
            assert_eq!(*count.lock(), 0);
            assert_eq!(broker.stats().published, 0, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_deliveries_agree_with_matcher() {
        let patterns = ["a.*", "a.#", "*.b", "#", "a.b", "*.*.c", "a.*.c"];
        let events = ["a", "a.b", "a.b.c", "x.b", "a.x.c", "b"];

        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let mut subs = Vec::new();
            for pattern in patterns {
                let tx = tx.clone();
                let label = pattern.to_string();
                subs.push(
                    broker
                        .subscribe(
                            &ctx,
                            pattern,
                            handler(move |payload| {
                                let event: String = payload.decode().unwrap_or_default();
                                let _ = tx.send(format!("{label}|{event}"));
                            }),
                        )
                        .await
                        .unwrap(),
                );
            }

            let mut expected = Vec::new();
            for event in events {
                broker.publish(&ctx, event, event).await.unwrap();
                for pattern in patterns {
                    if matches(pattern, event) {
                        expected.push(format!("{pattern}|{event}"));
                    }
                }
            }
            expected.sort();

            let got = collect(&mut rx, expected.len()).await;
            assert_eq!(got, expected, "{}", broker.backend());
            drop(subs);
            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stats_track_subscriptions() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let (h1, _) = counter();
            let (h2, _) = counter();
            let a = broker.subscribe(&ctx, "s.*", h1).await.unwrap();
            let _b = broker.subscribe(&ctx, "s.x", h2).await.unwrap();
            assert_eq!(broker.stats().subscriptions, 2, "{}", broker.backend());

            a.unsubscribe().await.unwrap();
            assert_eq!(broker.stats().subscriptions, 1);
            broker.close().await.unwrap();
        }
    }
}
