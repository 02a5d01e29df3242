//! Multi-instance fan-out over a shared in-process relay
//!
//! Two gateway instances share one `MemoryRelay`. Whatever either instance
//! produces must reach every subscriber exactly once, regardless of which
//! instance produced it first.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use outfall_gateway::fanout::outcome;
use outfall_gateway::{
    BroadcastHub, Connection, Envelope, FanOutBridge, FanOutConfig, HubConfig, MemoryRelay,
    MetricsRecorder, MetricsSnapshot, Permit, PermitRule, Pipeline, Reading, ReadingSender,
    Severity, Topic,
};
use std::sync::Arc;
use std::time::Duration;

struct Instance {
    sender: ReadingSender,
    hub: Arc<BroadcastHub>,
    metrics: Arc<MetricsRecorder>,
}

fn permit() -> Permit {
    Permit::new().with_rule(
        "As",
        PermitRule::new(0.01, 300.0).with_hysteresis(1, 3),
    )
}

fn instance(relay: &MemoryRelay, id: &str) -> Instance {
    let metrics = Arc::new(MetricsRecorder::new().unwrap());
    let hub = Arc::new(BroadcastHub::new(HubConfig::default(), Arc::clone(&metrics)));
    let (bridge, fanout_runner) = FanOutBridge::new(
        Arc::new(relay.clone()),
        FanOutConfig::new(id),
        Arc::clone(&hub),
        Arc::clone(&metrics),
    );
    let (sender, runner) = Pipeline::new(Arc::new(permit()), Arc::clone(&hub), Arc::clone(&metrics))
        .fanout(bridge)
        .build();
    tokio::spawn(fanout_runner.run());
    tokio::spawn(runner.run());
    Instance {
        sender,
        hub,
        metrics,
    }
}

fn drain(conn: &Connection) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Some(msg) = conn.queue().try_pop() {
        out.push(serde_json::from_slice(&msg.payload).unwrap());
    }
    out
}

async fn wait_for(metrics: &MetricsRecorder, label: &str, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if MetricsSnapshot::count(&metrics.snapshot().fanout, label) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fan-out activity");
}

async fn wait_queued(conn: &Connection, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.queue().len() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued envelopes");
}

#[tokio::test]
async fn remote_alert_reaches_local_subscriber() {
    let relay = MemoryRelay::new("effluent");
    let a = instance(&relay, "plant-a");
    let b = instance(&relay, "plant-b");
    let subscriber = b.hub.register(true);

    a.sender
        .push(Reading::new("As", 1.0, 0.05).unwrap())
        .await
        .unwrap();
    a.sender.flush().await.unwrap();

    wait_for(&b.metrics, outcome::RECEIVED, 2).await;
    wait_queued(&subscriber, 2).await;
    let envelopes = drain(&subscriber);
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].kind, Topic::Reading);
    assert_eq!(envelopes[1].kind, Topic::Alert);
    assert_eq!(envelopes[1].severity, Some(Severity::Critical));

    // a never delivers its own relayed copies a second time
    wait_for(&a.metrics, outcome::ECHO, 2).await;
    assert_eq!(
        MetricsSnapshot::count(&a.metrics.snapshot().fanout, outcome::RECEIVED),
        0
    );
}

#[tokio::test]
async fn same_event_on_both_instances_delivered_once() {
    let relay = MemoryRelay::new("effluent");
    let a = instance(&relay, "plant-a");
    let b = instance(&relay, "plant-b");
    let sub_a = a.hub.register(true);
    let sub_b = b.hub.register(true);

    let reading = Reading::new("As", 42.0, 0.05).unwrap();
    a.sender.push(reading.clone()).await.unwrap();
    b.sender.push(reading).await.unwrap();
    a.sender.flush().await.unwrap();
    b.sender.flush().await.unwrap();

    // Each instance drops two copies: reading and alert
    wait_for(&a.metrics, outcome::DEDUPED, 2).await;
    wait_for(&b.metrics, outcome::DEDUPED, 2).await;

    for subscriber in [&sub_a, &sub_b] {
        wait_queued(subscriber, 2).await;
        let envelopes = drain(subscriber);
        let alerts: Vec<&Envelope> = envelopes
            .iter()
            .filter(|e| e.kind == Topic::Alert)
            .collect();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].timestamp, 42.0);
    }
}

#[tokio::test]
async fn same_transition_from_different_values_delivered_once() {
    let relay = MemoryRelay::new("effluent");
    let a = instance(&relay, "plant-a");
    let b = instance(&relay, "plant-b");
    let sub_a = a.hub.register(true);
    let sub_b = b.hub.register(true);

    // Both plants cross CRITICAL at t=10 from slightly different samples
    a.sender
        .push(Reading::new("As", 10.0, 0.020).unwrap())
        .await
        .unwrap();
    b.sender
        .push(Reading::new("As", 10.0, 0.021).unwrap())
        .await
        .unwrap();
    a.sender.flush().await.unwrap();
    b.sender.flush().await.unwrap();

    wait_for(&a.metrics, outcome::DEDUPED, 1).await;
    wait_for(&b.metrics, outcome::DEDUPED, 1).await;

    for subscriber in [&sub_a, &sub_b] {
        // Both readings (distinct values) and one alert
        wait_queued(subscriber, 3).await;
        let envelopes = drain(subscriber);
        assert_eq!(envelopes.len(), 3);
        let alerts: Vec<&Envelope> = envelopes
            .iter()
            .filter(|e| e.kind == Topic::Alert)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Some(Severity::Critical));
    }
}

#[tokio::test]
async fn lone_instance_delivers_locally() {
    let relay = MemoryRelay::new("effluent");
    let a = instance(&relay, "plant-a");
    let subscriber = a.hub.register(true);

    for ts in 0..20 {
        a.sender
            .push(Reading::new("As", ts as f64, 0.001).unwrap())
            .await
            .unwrap();
    }
    a.sender.flush().await.unwrap();

    assert_eq!(drain(&subscriber).len(), 20);
}
