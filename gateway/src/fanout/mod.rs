//! FanOutBridge - multi-instance relay
//!
//! Cooperating instances share one [`RelayChannel`]. Every envelope a local
//! shard publishes is claimed in the de-dup window and queued on a bounded
//! outbox; a background task drains the outbox onto the relay with retry.
//! Envelopes arriving from the relay are delivered to the local
//! [`BroadcastHub`] unless they are our own echo or were already seen.
//!
//! ```text
//!  shard ──► claim(event_id) ──► hub.publish
//!                 │
//!                 └──► outbox ──► RetryingRelay ──► relay channel
//!                                                        │
//!  hub.publish ◄── dedup ◄── skip own origin ◄───────────┘
//! ```
//!
//! Relay failures are logged and counted; they never block local delivery.

mod dedup;
mod memory;
mod retry;

pub use dedup::SeenIds;
pub use memory::{DEFAULT_RELAY_CAPACITY, MemoryRelay};
pub use retry::{BackoffConfig, RetryingRelay};

use crate::hub::BroadcastHub;
use crate::metrics::MetricsRecorder;
use outfall_core::{Envelope, FanOutMessage, RelayChannel, RelaySubscription, Topic};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Fan-out activity labels on `outfall_fanout_total`
pub mod outcome {
    pub const RELAYED: &str = "relayed";
    pub const RECEIVED: &str = "received";
    pub const DEDUPED: &str = "deduped";
    pub const ECHO: &str = "echo";
    pub const ERROR: &str = "error";
    pub const OUTBOX_FULL: &str = "outbox_full";
}

/// Stable id of a logical event
///
/// Alerts hash kind, species, timestamp and severity, so the same transition
/// seen by two instances collapses to one id even when the triggering values
/// differ. Readings also hash the value, since two readings of one species
/// may share a timestamp. The origin is never part of the id.
pub fn event_id(envelope: &Envelope) -> String {
    let mut hasher = Sha256::new();
    hasher.update(envelope.kind.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(envelope.species.as_bytes());
    hasher.update([0x1f]);
    hasher.update(envelope.timestamp.to_bits().to_be_bytes());
    hasher.update([0x1f]);
    match envelope.kind {
        Topic::Alert => {
            hasher.update(envelope.severity.map(|s| s.as_str()).unwrap_or("-").as_bytes());
        }
        Topic::Reading => hasher.update(envelope.value.to_bits().to_be_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Bridge settings
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    pub instance_id: String,
    pub dedup_window: Duration,
    pub outbox_capacity: usize,
    pub backoff: BackoffConfig,
}

impl FanOutConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            dedup_window: Duration::from_secs(60),
            outbox_capacity: 1024,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Local side of the bridge, shared by every shard
pub struct FanOutBridge {
    instance_id: String,
    seen: Arc<SeenIds>,
    outbox: mpsc::Sender<FanOutMessage>,
    metrics: Arc<MetricsRecorder>,
}

impl FanOutBridge {
    /// Create the bridge and its background runner
    ///
    /// The relay subscription is opened here so nothing published after
    /// construction is missed.
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        config: FanOutConfig,
        hub: Arc<BroadcastHub>,
        metrics: Arc<MetricsRecorder>,
    ) -> (Arc<Self>, FanOutRunner) {
        let (tx, rx) = mpsc::channel(config.outbox_capacity.max(1));
        let seen = Arc::new(SeenIds::new(config.dedup_window));
        let subscription = relay.subscribe();

        let bridge = Arc::new(Self {
            instance_id: config.instance_id.clone(),
            seen: Arc::clone(&seen),
            outbox: tx,
            metrics: Arc::clone(&metrics),
        });

        let runner = FanOutRunner {
            outbound: Outbound {
                rx,
                relay: RetryingRelay::new(relay, config.backoff),
                metrics: Arc::clone(&metrics),
            },
            inbound: Inbound {
                instance_id: config.instance_id,
                subscription,
                seen,
                hub,
                metrics,
            },
        };

        (bridge, runner)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Claim a locally produced envelope and queue it for the relay
    ///
    /// Returns false when the same logical event was already delivered
    /// (typically relayed by another instance first); the caller then skips
    /// local delivery too. Never blocks: a full outbox drops the relay copy.
    pub fn publish_local(&self, envelope: &Envelope) -> bool {
        let id = event_id(envelope);
        if !self.seen.check(&id) {
            self.metrics.record_fanout(outcome::DEDUPED);
            debug!(event_id = %id, species = %envelope.species, "Local event already delivered");
            return false;
        }

        let message = FanOutMessage {
            origin_instance_id: self.instance_id.clone(),
            event_id: id,
            payload: envelope.clone(),
        };
        match self.outbox.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.metrics.record_fanout(outcome::OUTBOX_FULL);
                warn!(event_id = %msg.event_id, "Relay outbox full, event not relayed");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_fanout(outcome::ERROR);
                debug!("Relay outbox closed");
            }
        }
        true
    }

    /// Ids currently inside the de-dup window
    pub fn tracked_ids(&self) -> usize {
        self.seen.len()
    }
}

/// Background half of the bridge
pub struct FanOutRunner {
    outbound: Outbound,
    inbound: Inbound,
}

impl FanOutRunner {
    /// Drain the outbox and consume the relay subscription
    ///
    /// Returns once every [`FanOutBridge`] handle is dropped and the outbox is
    /// empty, or when the relay closes and the outbox is done.
    pub async fn run(self) {
        info!(
            instance = %self.inbound.instance_id,
            relay = self.outbound.relay.inner().name(),
            "Fan-out bridge started"
        );
        let (done_tx, done_rx) = watch::channel(false);
        let outbound = async move {
            self.outbound.run().await;
            let _ = done_tx.send(true);
        };
        tokio::join!(outbound, self.inbound.run(done_rx));
        info!("Fan-out bridge stopped");
    }
}

struct Outbound {
    rx: mpsc::Receiver<FanOutMessage>,
    relay: RetryingRelay,
    metrics: Arc<MetricsRecorder>,
}

impl Outbound {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match self.relay.publish(&message).await {
                Ok(()) => self.metrics.record_fanout(outcome::RELAYED),
                Err(e) => {
                    self.metrics.record_fanout(outcome::ERROR);
                    error!(
                        event_id = %message.event_id,
                        reason = e.reason(),
                        error = %e,
                        "Relay publish gave up"
                    );
                }
            }
        }
    }
}

struct Inbound {
    instance_id: String,
    subscription: Box<dyn RelaySubscription>,
    seen: Arc<SeenIds>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<MetricsRecorder>,
}

impl Inbound {
    async fn run(mut self, mut done: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                received = self.subscription.recv() => match received {
                    Ok(Some(message)) => self.accept(message),
                    Ok(None) => {
                        debug!("Relay subscription closed");
                        return;
                    }
                    Err(e) => {
                        self.metrics.record_fanout(outcome::ERROR);
                        warn!(reason = e.reason(), error = %e, "Relay receive failed");
                    }
                },
                _ = done.changed() => return,
            }
        }
    }

    fn accept(&self, message: FanOutMessage) {
        if message.origin_instance_id == self.instance_id {
            self.metrics.record_fanout(outcome::ECHO);
            return;
        }
        if !self.seen.check(&message.event_id) {
            self.metrics.record_fanout(outcome::DEDUPED);
            debug!(
                event_id = %message.event_id,
                origin = %message.origin_instance_id,
                "Duplicate relayed event dropped"
            );
            return;
        }

        self.metrics.record_fanout(outcome::RECEIVED);
        if let Err(e) = self.hub.publish(&message.payload) {
            warn!(
                event_id = %message.event_id,
                reason = e.reason(),
                error = %e,
                "Relayed event not delivered"
            );
        }
    }
}
