//! # Concurrent Use
//!
//! Brokers are shared across tasks. Racing operations must leave the
//! registry and the wire ref-counts consistent.

#[cfg(test)]
mod tests {
    use crate::integration::support::{counter, in_process_brokers, mqtt_loopback};
    use event_broker::{handler, Context, EventBroker, EventBrokerExt};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_subscribe_unsubscribe_leaves_no_residue() {
        for broker in in_process_brokers() {
            let tasks = (0..32).map(|i| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let ctx = Context::background();
                    let pattern = if i % 2 == 0 { "race.*" } else { "race.#" };
                    let (h, _) = counter();
                    let sub = broker.subscribe(&ctx, pattern, h).await.unwrap();
                    tokio::task::yield_now().await;
                    sub.unsubscribe().await.unwrap();
                })
            });
            for joined in join_all(tasks).await {
                joined.unwrap();
            }
            assert_eq!(broker.stats().subscriptions, 0, "{}", broker.backend());
            broker.close().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wire_refcount_survives_races() {
        let (broker, wire) = mqtt_loopback();

        let tasks = (0..16).map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let ctx = Context::background();
                let (h, _) = counter();
                broker.subscribe(&ctx, "shared.topic", h).await.unwrap()
            })
        });
        let mut subs = Vec::new();
        for joined in join_all(tasks).await {
            subs.push(joined.unwrap());
        }
        assert_eq!(wire.subscribes("shared/topic"), 1);

        let releases = subs.into_iter().map(|sub| tokio::spawn(sub.unsubscribe()));
        for joined in join_all(releases).await {
            joined.unwrap().unwrap();
        }
        assert_eq!(wire.unsubscribes("shared/topic"), 1);
        assert_eq!(broker.stats().subscriptions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers_deliver_every_event() {
        for broker in in_process_brokers() {
            let ctx = Context::background();
            let received = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&received);
            let _sub = broker
                .subscribe(
                    &ctx,
                    "load.#",
                    handler(move |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await
                .unwrap();

            let publishers = (0..8).map(|p| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let ctx = Context::background();
                    for n in 0..25u32 {
                        broker.publish(&ctx, &format!("load.p{p}"), &n).await.unwrap();
                    }
                })
            });
            for joined in join_all(publishers).await {
                joined.unwrap();
            }

            let all_in = tokio::time::timeout(Duration::from_secs(5), async {
                while received.load(Ordering::SeqCst) < 200 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            assert!(all_in.is_ok(), "{}: {}", broker.backend(), received.load(Ordering::SeqCst));
            assert_eq!(broker.stats().published, 200);
            broker.close().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_while_publishing_is_clean() {
        for broker in in_process_brokers() {
            let publisher = {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let ctx = Context::background();
                    let mut accepted = 0u32;
                    while broker.publish(&ctx, "spin", &accepted).await.is_ok() {
                        accepted += 1;
                        tokio::task::yield_now().await;
                    }
                    accepted
                })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker.close().await.unwrap();

            let accepted = tokio::time::timeout(Duration::from_secs(2), publisher)
                .await
                .expect("publisher did not observe close")
                .unwrap();
            assert_eq!(u64::from(accepted), broker.stats().published);
        }
    }
}
