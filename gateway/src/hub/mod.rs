//! BroadcastHub - subscriber registry and fan-out
//!
//! The hub owns every [`Connection`]. Publishing serializes an [`Envelope`]
//! once and enqueues the shared bytes onto each subscribed connection's
//! bounded queue without blocking:
//!
//! ```text
//!                        ┌─► queue(conn 1) ──► writer task ──► socket
//! publish(envelope) ─────┼─► queue(conn 2) ──► writer task ──► socket
//!   (serialize once)     └─► queue(conn n) ──► writer task ──► socket
//! ```
//!
//! A queue that stays full for longer than the slow-consumer grace period
//! gets its connection force-closed.
//!
//! The registry lock is held only for map operations and non-blocking
//! enqueues, never across I/O, so register / deregister / publish are
//! linearizable.

mod connection;
mod queue;

pub use connection::{Connection, ConnectionId, ConnectionStatus};
pub use queue::{EnqueueOutcome, Outbound, OutboundQueue};

use crate::metrics::{MetricsRecorder, drop_reason};
use crate::rate_limit::RateLimiter;
use bytes::Bytes;
use outfall_core::{Envelope, PipelineError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-connection limits applied by the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue size (K)
    pub queue_capacity: usize,
    /// How long a queue may stay full before its connection is closed
    pub slow_consumer_grace: Duration,
    /// Serialized envelope size cap
    pub max_outbound_bytes: usize,
    /// Inbound messages per second per connection
    pub rate_per_sec: f64,
    /// Inbound burst per connection
    pub rate_burst: u32,
    /// Inbound message size cap
    pub max_inbound_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            slow_consumer_grace: Duration::from_secs(5),
            max_outbound_bytes: 65536,
            rate_per_sec: 20.0,
            rate_burst: 40,
            max_inbound_bytes: 4096,
        }
    }
}

impl HubConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            slow_consumer_grace: config.slow_consumer_grace,
            max_outbound_bytes: config.max_outbound_bytes,
            rate_per_sec: config.rate_per_sec,
            rate_burst: config.rate_burst,
            max_inbound_bytes: config.max_inbound_bytes,
        }
    }
}

/// What one publish did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the message was enqueued on
    pub delivered: usize,
    /// Older non-critical messages evicted to make room
    pub evicted_oldest: usize,
    /// Connections whose queue was saturated with critical messages
    pub dropped: usize,
    /// Connections force-closed as slow consumers
    pub disconnected: Vec<ConnectionId>,
}

/// Registry of subscriber connections
pub struct BroadcastHub {
    config: HubConfig,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    metrics: Arc<MetricsRecorder>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new connection, subscribed to every topic
    pub fn register(&self, authenticated: bool) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let limiter = RateLimiter::new(
            self.config.rate_per_sec,
            self.config.rate_burst,
            self.config.max_inbound_bytes,
        );
        let connection = Arc::new(Connection::new(
            id,
            self.config.queue_capacity,
            limiter,
            authenticated,
        ));

        self.connections.lock().insert(id, Arc::clone(&connection));
        self.metrics.connection_opened();
        debug!(connection = id, authenticated, "Connection registered");
        connection
    }

    /// Remove a connection and discard its queue
    ///
    /// Returns false if the connection was already gone.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().remove(&id);
        match removed {
            Some(connection) => {
                self.close_connection(&connection);
                debug!(connection = id, "Connection deregistered");
                true
            }
            None => false,
        }
    }

    /// Serialize once and enqueue on every subscribed connection
    pub fn publish(&self, envelope: &Envelope) -> Result<PublishReport, PipelineError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| PipelineError::Validation(format!("envelope serialization: {e}")))?;
        if payload.len() > self.config.max_outbound_bytes {
            self.metrics.record_too_large("outbound");
            self.metrics.record_dropped(drop_reason::TOO_LARGE, 1);
            return Err(PipelineError::MessageTooLarge {
                size: payload.len(),
                limit: self.config.max_outbound_bytes,
            });
        }

        let topic = envelope.topic();
        let outbound = Outbound {
            topic,
            critical: envelope.is_critical(),
            payload: Bytes::from(payload),
        };

        let mut report = PublishReport::default();
        let mut slow = Vec::new();
        {
            let connections = self.connections.lock();
            for connection in connections.values() {
                if !connection.is_subscribed(topic) {
                    continue;
                }
                match connection.queue().push(outbound.clone()) {
                    EnqueueOutcome::Queued => report.delivered += 1,
                    EnqueueOutcome::EvictedOldest => {
                        report.delivered += 1;
                        report.evicted_oldest += 1;
                    }
                    EnqueueOutcome::DroppedNew => report.dropped += 1,
                    EnqueueOutcome::Closed => {}
                }
                if self.past_grace(connection) {
                    slow.push(connection.id());
                }
            }
        }

        self.metrics.record_published(topic.as_str());
        self.metrics
            .record_dropped(drop_reason::OLDEST_EVICTED, report.evicted_oldest as u64);
        self.metrics
            .record_dropped(drop_reason::CRITICAL_SATURATED, report.dropped as u64);
        if report.dropped > 0 {
            warn!(
                species = %envelope.species,
                connections = report.dropped,
                "Outbound queues saturated with critical alerts, message dropped"
            );
        }

        report.disconnected = self.evict(slow);
        Ok(report)
    }

    /// Force-close every connection whose queue has been full past the grace period
    pub fn evict_slow_consumers(&self) -> Vec<ConnectionId> {
        let slow: Vec<ConnectionId> = self
            .connections
            .lock()
            .values()
            .filter(|c| self.past_grace(c))
            .map(|c| c.id())
            .collect();
        self.evict(slow)
    }

    fn past_grace(&self, connection: &Connection) -> bool {
        connection
            .queue()
            .full_since()
            .is_some_and(|since| since.elapsed() > self.config.slow_consumer_grace)
    }

    fn evict(&self, ids: Vec<ConnectionId>) -> Vec<ConnectionId> {
        let mut evicted = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = self.connections.lock().remove(&id);
            if let Some(connection) = removed {
                self.close_connection(&connection);
                self.metrics.slow_consumer_disconnects.inc();
                let err = PipelineError::SlowConsumerDisconnected(id);
                warn!(connection = id, reason = err.reason(), "{err}");
                evicted.push(id);
            }
        }
        evicted
    }

    fn close_connection(&self, connection: &Connection) {
        let discarded = connection.queue().close();
        self.metrics
            .record_dropped(drop_reason::DISCONNECT_DISCARD, discarded as u64);
        self.metrics.connection_closed();
    }

    /// Close every connection (shutdown)
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            self.close_connection(connection);
        }
        if !drained.is_empty() {
            info!(connections = drained.len(), "Closed all subscriber connections");
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Per-connection occupancy, ordered by id
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().values().cloned().collect();
        let mut statuses: Vec<ConnectionStatus> =
            connections.iter().map(|c| c.status()).collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }
}
