//! # Matcher Benchmarks
//!
//! Pattern matching runs once per registered pattern on every publish, so
//! it sits on the hot path of the memory broker and the MQTT router.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_broker::pattern::{CANONICAL, MQTT};
use event_broker::topic;

fn bench_canonical_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher-canonical");

    let cases = [
        ("exact", "user.created", "user.created"),
        ("single", "user.*", "user.created"),
        ("multi-tail", "logs.#", "logs.error.db.primary"),
        ("miss", "orders.*.shipped", "orders.42.cancelled"),
        ("deep", "a.*.c.*.e.*.g", "a.b.c.d.e.f.g"),
    ];
    for (name, pattern, event) in cases {
        group.bench_function(name, |b| {
            b.iter(|| black_box(CANONICAL.matches(black_box(pattern), black_box(event))))
        });
    }
    group.finish();
}

fn bench_registry_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher-scan");

    for size in [10usize, 100, 1000] {
        let patterns: Vec<String> = (0..size)
            .map(|i| match i % 3 {
                0 => format!("svc{i}.*"),
                1 => format!("svc{i}.events.#"),
                _ => format!("svc{i}.events.created"),
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("scan", size), &patterns, |b, patterns| {
            b.iter(|| {
                patterns
                    .iter()
                    .filter(|p| CANONICAL.matches(p, black_box("svc7.events.created")))
                    .count()
            })
        });
    }
    group.finish();
}

fn bench_mqtt_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher-mqtt");

    group.bench_function("translate_filter", |b| {
        b.iter(|| topic::mqtt_filter(black_box("sensor.*.temp.#")))
    });
    group.bench_function("translate_topic", |b| {
        b.iter(|| topic::mqtt_topic(black_box("sensor.7.temp.celsius")))
    });
    group.bench_function("match", |b| {
        b.iter(|| MQTT.matches(black_box("sensor/+/temp/#"), black_box("sensor/7/temp/celsius")))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_canonical_matcher,
    bench_registry_scan,
    bench_mqtt_path
);
criterion_main!(benches);
