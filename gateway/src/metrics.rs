//! Prometheus metrics for the outfall pipeline
//!
//! [`MetricsRecorder`] owns its own [`Registry`]; there is no process-wide
//! metrics singleton. Components receive an `Arc<MetricsRecorder>` at
//! construction time.

use crate::error::Result;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;

/// Drop reasons recorded on `outfall_messages_dropped_total`
pub mod drop_reason {
    /// Oldest non-critical message evicted to make room
    pub const OLDEST_EVICTED: &str = "oldest_evicted";
    /// Queue held only critical messages, new one dropped
    pub const CRITICAL_SATURATED: &str = "critical_saturated";
    /// Queued messages discarded when a connection closed
    pub const DISCONNECT_DISCARD: &str = "disconnect_discard";
    /// Outbound message above the byte cap
    pub const TOO_LARGE: &str = "too_large";
}

/// All pipeline metrics
pub struct MetricsRecorder {
    registry: Registry,

    // ─────────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────────
    /// Readings accepted into a window
    pub readings_ingested: IntCounter,

    /// Readings rejected (by reason)
    pub readings_rejected: IntCounterVec,

    /// Alert transitions (by new severity)
    pub alerts: IntCounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Broadcast
    // ─────────────────────────────────────────────────────────────────────────
    /// Envelopes published (by kind)
    pub messages_published: IntCounterVec,

    /// Messages dropped (by reason)
    pub messages_dropped: IntCounterVec,

    /// Inbound client messages rejected by the token bucket
    pub rate_limited: IntCounter,

    /// Messages above the byte cap (by direction)
    pub too_large: IntCounterVec,

    /// Malformed client control messages
    pub invalid_control: IntCounter,

    /// Connections force-closed as slow consumers
    pub slow_consumer_disconnects: IntCounter,

    /// Failed authentication attempts
    pub auth_failures: IntCounter,

    /// Status API requests answered with 429
    pub http_rate_limited: IntCounter,

    /// Currently registered connections
    pub active_connections: IntGauge,

    /// Connections ever registered
    pub connections_total: IntCounter,

    // ─────────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────────
    /// Relay activity (by outcome: relayed, received, deduped, error, outbox_full)
    pub fanout: IntCounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    /// Entries in the recent-readings buffer
    pub recent_buffer_len: IntGauge,
}

impl MetricsRecorder {
    /// Create a recorder with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let readings_ingested = IntCounter::new(
            "outfall_readings_ingested_total",
            "Readings accepted into a species window",
        )?;
        let readings_rejected = IntCounterVec::new(
            Opts::new("outfall_readings_rejected_total", "Readings rejected"),
            &["reason"],
        )?;
        let alerts = IntCounterVec::new(
            Opts::new("outfall_alerts_total", "Alert state transitions"),
            &["severity"],
        )?;
        let messages_published = IntCounterVec::new(
            Opts::new("outfall_messages_published_total", "Envelopes published"),
            &["kind"],
        )?;
        let messages_dropped = IntCounterVec::new(
            Opts::new("outfall_messages_dropped_total", "Outbound messages dropped"),
            &["reason"],
        )?;
        let rate_limited = IntCounter::new(
            "outfall_rate_limited_total",
            "Client messages rejected by the rate limiter",
        )?;
        let too_large = IntCounterVec::new(
            Opts::new(
                "outfall_messages_too_large_total",
                "Messages above the byte cap",
            ),
            &["direction"],
        )?;
        let invalid_control = IntCounter::new(
            "outfall_invalid_control_total",
            "Malformed client control messages",
        )?;
        let slow_consumer_disconnects = IntCounter::new(
            "outfall_slow_consumer_disconnects_total",
            "Connections closed as slow consumers",
        )?;
        let auth_failures = IntCounter::new(
            "outfall_auth_failures_total",
            "Rejected authentication attempts",
        )?;
        let http_rate_limited = IntCounter::new(
            "outfall_http_rate_limited_total",
            "Status API requests rejected by the per-client rate limit",
        )?;
        let active_connections = IntGauge::new(
            "outfall_active_connections",
            "Currently registered subscriber connections",
        )?;
        let connections_total = IntCounter::new(
            "outfall_connections_total",
            "Subscriber connections registered",
        )?;
        let fanout = IntCounterVec::new(
            Opts::new("outfall_fanout_total", "Multi-instance relay activity"),
            &["outcome"],
        )?;
        let recent_buffer_len = IntGauge::new(
            "outfall_recent_buffer_len",
            "Entries in the recent-readings buffer",
        )?;

        registry.register(Box::new(readings_ingested.clone()))?;
        registry.register(Box::new(readings_rejected.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        registry.register(Box::new(messages_published.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(too_large.clone()))?;
        registry.register(Box::new(invalid_control.clone()))?;
        registry.register(Box::new(slow_consumer_disconnects.clone()))?;
        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(http_rate_limited.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(fanout.clone()))?;
        registry.register(Box::new(recent_buffer_len.clone()))?;

        Ok(Self {
            registry,
            readings_ingested,
            readings_rejected,
            alerts,
            messages_published,
            messages_dropped,
            rate_limited,
            too_large,
            invalid_control,
            slow_consumer_disconnects,
            auth_failures,
            http_rate_limited,
            active_connections,
            connections_total,
            fanout,
            recent_buffer_len,
        })
    }

    /// Registry backing this recorder
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recording helpers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_ingested(&self) {
        self.readings_ingested.inc();
    }

    pub fn record_rejected(&self, reason: &str) {
        self.readings_rejected.with_label_values(&[reason]).inc();
    }

    pub fn record_alert(&self, severity: &str) {
        self.alerts.with_label_values(&[severity]).inc();
    }

    pub fn record_published(&self, kind: &str) {
        self.messages_published.with_label_values(&[kind]).inc();
    }

    pub fn record_dropped(&self, reason: &str, count: u64) {
        if count > 0 {
            self.messages_dropped
                .with_label_values(&[reason])
                .inc_by(count);
        }
    }

    pub fn record_too_large(&self, direction: &str) {
        self.too_large.with_label_values(&[direction]).inc();
    }

    pub fn record_fanout(&self, outcome: &str) {
        self.fanout.with_label_values(&[outcome]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Export
    // ─────────────────────────────────────────────────────────────────────────

    /// Encode every metric in Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            readings_ingested: self.readings_ingested.get(),
            readings_rejected: label_totals(&self.readings_rejected),
            alerts: label_totals(&self.alerts),
            messages_published: label_totals(&self.messages_published),
            messages_dropped: label_totals(&self.messages_dropped),
            rate_limited: self.rate_limited.get(),
            too_large: label_totals(&self.too_large),
            invalid_control: self.invalid_control.get(),
            slow_consumer_disconnects: self.slow_consumer_disconnects.get(),
            auth_failures: self.auth_failures.get(),
            http_rate_limited: self.http_rate_limited.get(),
            active_connections: self.active_connections.get(),
            connections_total: self.connections_total.get(),
            fanout: label_totals(&self.fanout),
            recent_buffer_len: self.recent_buffer_len.get(),
        }
    }
}

/// Serializable view of [`MetricsRecorder`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub readings_ingested: u64,
    pub readings_rejected: BTreeMap<String, u64>,
    pub alerts: BTreeMap<String, u64>,
    pub messages_published: BTreeMap<String, u64>,
    pub messages_dropped: BTreeMap<String, u64>,
    pub rate_limited: u64,
    pub too_large: BTreeMap<String, u64>,
    pub invalid_control: u64,
    pub slow_consumer_disconnects: u64,
    pub auth_failures: u64,
    pub http_rate_limited: u64,
    pub active_connections: i64,
    pub connections_total: u64,
    pub fanout: BTreeMap<String, u64>,
    pub recent_buffer_len: i64,
}

impl MetricsSnapshot {
    /// Count for one label of a labelled counter map, 0 when absent
    pub fn count(map: &BTreeMap<String, u64>, label: &str) -> u64 {
        map.get(label).copied().unwrap_or(0)
    }
}

/// Sum a single-label counter vector by label value
fn label_totals(vec: &IntCounterVec) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let Some(label) = metric.get_label().first() else {
                continue;
            };
            let value = metric.get_counter().get_value() as u64;
            *totals.entry(label.get_value().to_string()).or_insert(0) += value;
        }
    }
    totals
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_are_independent() {
        // Two owned registries never collide on metric names
        let a = MetricsRecorder::new().unwrap();
        let b = MetricsRecorder::new().unwrap();
        a.record_ingested();
        assert_eq!(a.snapshot().readings_ingested, 1);
        assert_eq!(b.snapshot().readings_ingested, 0);
    }

    #[test]
    fn test_snapshot_groups_labels() {
        let m = MetricsRecorder::new().unwrap();
        m.record_rejected("out_of_order");
        m.record_rejected("out_of_order");
        m.record_rejected("validation");
        m.record_dropped(drop_reason::OLDEST_EVICTED, 5);
        m.record_dropped(drop_reason::CRITICAL_SATURATED, 0);

        let snap = m.snapshot();
        assert_eq!(MetricsSnapshot::count(&snap.readings_rejected, "out_of_order"), 2);
        assert_eq!(MetricsSnapshot::count(&snap.readings_rejected, "validation"), 1);
        assert_eq!(
            MetricsSnapshot::count(&snap.messages_dropped, drop_reason::OLDEST_EVICTED),
            5
        );
        assert!(!snap.messages_dropped.contains_key(drop_reason::CRITICAL_SATURATED));
    }

    #[test]
    fn test_connection_gauges() {
        let m = MetricsRecorder::new().unwrap();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.connections_total, 2);
    }

    #[test]
    fn test_encode_prometheus_text() {
        let m = MetricsRecorder::new().unwrap();
        m.record_alert("critical");
        m.record_fanout("relayed");
        let text = m.encode().unwrap();
        assert!(text.contains("outfall_alerts_total{severity=\"critical\"} 1"));
        assert!(text.contains("outfall_fanout_total{outcome=\"relayed\"} 1"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = MetricsRecorder::new().unwrap();
        m.record_published("alert");
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["messages_published"]["alert"], 1);
    }
}
