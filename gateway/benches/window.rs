//! Hot-path benchmarks
//!
//! Measures per-reading cost of window ingest plus rule evaluation, and the
//! cost of serializing an envelope once and enqueueing it on many
//! connections.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use outfall_gateway::alert::AlertStateMachine;
use outfall_gateway::rules::evaluate;
use outfall_gateway::{
    BroadcastHub, Envelope, HubConfig, MetricsRecorder, Permit, Reading, WindowTracker,
};
use std::hint::black_box;
use std::sync::Arc;

fn readings(n: usize) -> Vec<Reading> {
    let species = ["SO4", "As", "Ni"];
    (0..n)
        .map(|i| {
            let value = if i % 50 == 0 { 400.0 } else { 120.0 };
            Reading::new(species[i % species.len()], i as f64 * 0.5, value).unwrap()
        })
        .collect()
}

fn bench_window_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_ingest");
    let batch = readings(10_000);
    group.throughput(Throughput::Elements(batch.len() as u64));

    group.bench_function("ingest_only", |b| {
        b.iter(|| {
            let mut tracker = WindowTracker::new(Arc::new(Permit::default_effluent()));
            for reading in &batch {
                let _ = black_box(tracker.ingest(reading));
            }
        })
    });

    // Full per-reading path a shard runs, minus publishing
    group.bench_function("ingest_evaluate_transition", |b| {
        b.iter(|| {
            let permit = Arc::new(Permit::default_effluent());
            let mut tracker = WindowTracker::new(Arc::clone(&permit));
            let mut alerts = AlertStateMachine::new(Arc::clone(&permit));
            for reading in &batch {
                let Ok(aggregate) = tracker.ingest(reading) else {
                    continue;
                };
                let level = evaluate(
                    reading.value(),
                    aggregate.average,
                    permit.get(reading.species()),
                );
                black_box(alerts.transition(reading, level, aggregate.average));
            }
        })
    });

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_publish");
    let envelope = Envelope::reading(&Reading::new("SO4", 1.0, 180.0).unwrap());

    for connections in [1usize, 100, 1000] {
        group.throughput(Throughput::Elements(connections as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(connections),
            &connections,
            |b, &connections| {
                let metrics = Arc::new(MetricsRecorder::new().unwrap());
                let hub = BroadcastHub::new(HubConfig::default(), metrics);
                let subscribers: Vec<_> = (0..connections).map(|_| hub.register(true)).collect();
                b.iter(|| {
                    let _ = black_box(hub.publish(&envelope));
                    for conn in &subscribers {
                        conn.queue().try_pop();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_window_ingest, bench_publish);
criterion_main!(benches);
