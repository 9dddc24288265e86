//! # Memory Fan-Out Benchmarks
//!
//! Publish cost as the number of matching handlers grows. Each handler
//! invocation is its own task, so this measures dispatch, not handler work.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_broker::{handler, Context, EventBroker, EventBrokerExt, MemoryBroker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_fanout(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime");

    let mut group = c.benchmark_group("memory-fanout");

    for handlers in [1usize, 10, 100] {
        let broker = MemoryBroker::new();
        let delivered = Arc::new(AtomicU64::new(0));
        let ctx = Context::background();

        let subs = runtime.block_on(async {
            let mut subs = Vec::with_capacity(handlers);
            for i in 0..handlers {
                let delivered = Arc::clone(&delivered);
                let pattern = if i % 2 == 0 { "bench.*" } else { "bench.#" };
                let sub = broker
                    .subscribe(
                        &ctx,
                        pattern,
                        handler(move |_| {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }),
                    )
                    .await
                    .expect("subscribe");
                subs.push(sub);
            }
            subs
        });

        group.throughput(Throughput::Elements(handlers as u64));
        group.bench_with_input(BenchmarkId::new("publish", handlers), &handlers, |b, _| {
            b.to_async(&runtime).iter(|| async {
                broker
                    .publish(&ctx, "bench.tick", &42u64)
                    .await
                    .expect("publish");
            })
        });

        runtime.block_on(async {
            for sub in subs {
                let _ = sub.unsubscribe().await;
            }
            let _ = broker.close().await;
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fanout);
criterion_main!(benches);
