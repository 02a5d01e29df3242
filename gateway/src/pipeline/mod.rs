//! Pipeline - sharded reading ingestion
//!
//! Readings are routed to a shard by species hash, so every species is
//! processed by exactly one task, in arrival order, with no locks around
//! its window or alert state:
//!
//! ```text
//!                         ┌─► shard 0 ─┐
//! ReadingSender ─ hash ───┼─► shard 1 ─┼─► [fan-out claim] ─► BroadcastHub
//!   (species)             └─► shard n ─┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let (sender, runner) = Pipeline::new(permit, hub, metrics)
//!     .shards(4)
//!     .recent(recent)
//!     .build();
//! tokio::spawn(runner.run());
//! sender.push(Reading::new("As", 0.0, 0.02)?).await?;
//! ```

mod shard;

use crate::alert::AlertState;
use crate::error::{GatewayError, Result};
use crate::fanout::FanOutBridge;
use crate::hub::BroadcastHub;
use crate::metrics::MetricsRecorder;
use crate::recent::RecentReadings;
use crate::window::WindowAggregate;
use futures::future::join_all;
use outfall_core::{Permit, PipelineError, RawRecord, Reading, Severity};
use parking_lot::RwLock;
use serde::Serialize;
use shard::{Command, Shard, ShardContext};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Last known state of one species
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesStatus {
    pub species: String,
    pub severity: Severity,
    pub consecutive_exceed: u32,
    pub consecutive_ok: u32,
    pub last_emitted: Option<Severity>,
    pub window: WindowAggregate,
    pub last_timestamp: f64,
}

/// Read-side copy of per-species state, written by the owning shard
#[derive(Default)]
pub struct StatusBoard {
    species: RwLock<BTreeMap<String, SpeciesStatus>>,
}

impl StatusBoard {
    fn update(&self, species: &str, state: AlertState, window: WindowAggregate, timestamp: f64) {
        let status = SpeciesStatus {
            species: species.to_string(),
            severity: state.severity,
            consecutive_exceed: state.consecutive_exceed,
            consecutive_ok: state.consecutive_ok,
            last_emitted: state.last_emitted,
            window,
            last_timestamp: timestamp,
        };
        self.species.write().insert(species.to_string(), status);
    }

    fn remove(&self, species: &str) {
        self.species.write().remove(species);
    }

    pub fn get(&self, species: &str) -> Option<SpeciesStatus> {
        self.species.read().get(species).cloned()
    }

    /// Every tracked species, ordered by name
    pub fn snapshot(&self) -> Vec<SpeciesStatus> {
        self.species.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.species.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.read().is_empty()
    }
}

/// Builder for the sharded pipeline
pub struct Pipeline {
    permit: Arc<Permit>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<MetricsRecorder>,
    shards: usize,
    channel_capacity: usize,
    tolerance: f64,
    fanout: Option<Arc<FanOutBridge>>,
    recent: Option<Arc<RecentReadings>>,
}

impl Pipeline {
    pub fn new(permit: Arc<Permit>, hub: Arc<BroadcastHub>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            permit,
            hub,
            metrics,
            shards: 4,
            channel_capacity: 1024,
            tolerance: 0.0,
            fanout: None,
            recent: None,
        }
    }

    /// Number of shard tasks (minimum 1)
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Per-shard input channel capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Accept readings up to this many seconds older than the species' latest
    pub fn out_of_order_tolerance(mut self, seconds: f64) -> Self {
        self.tolerance = seconds.max(0.0);
        self
    }

    /// Relay every published envelope to peer instances
    pub fn fanout(mut self, bridge: Arc<FanOutBridge>) -> Self {
        self.fanout = Some(bridge);
        self
    }

    /// Keep accepted readings for the status surface
    pub fn recent(mut self, recent: Arc<RecentReadings>) -> Self {
        self.recent = Some(recent);
        self
    }

    pub fn build(self) -> (ReadingSender, PipelineRunner) {
        let board = Arc::new(StatusBoard::default());
        let ctx = ShardContext {
            permit: self.permit,
            hub: self.hub,
            metrics: Arc::clone(&self.metrics),
            fanout: self.fanout,
            recent: self.recent,
            board: Arc::clone(&board),
            tolerance: self.tolerance,
        };

        let mut senders = Vec::with_capacity(self.shards);
        let mut shards = Vec::with_capacity(self.shards);
        for index in 0..self.shards {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            senders.push(tx);
            shards.push(Shard::new(index, rx, ctx.clone()));
        }

        let sender = ReadingSender {
            shards: Arc::new(senders),
            board,
            metrics: self.metrics,
        };
        (sender, PipelineRunner { shards })
    }
}

/// Handle for feeding readings into the pipeline
///
/// Cloneable; the pipeline stops once every clone is dropped.
#[derive(Clone)]
pub struct ReadingSender {
    shards: Arc<Vec<mpsc::Sender<Command>>>,
    board: Arc<StatusBoard>,
    metrics: Arc<MetricsRecorder>,
}

impl ReadingSender {
    /// Shard index responsible for a species
    pub fn shard_for(&self, species: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        species.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, species: &str) -> &mpsc::Sender<Command> {
        &self.shards[self.shard_for(species)]
    }

    /// Enqueue a reading, waiting for room on its shard
    pub async fn push(&self, reading: Reading) -> Result<()> {
        self.shard(reading.species())
            .send(Command::Reading(reading))
            .await
            .map_err(|_| GatewayError::Closed)
    }

    /// Enqueue without waiting; a full shard rejects the reading
    pub fn try_push(&self, reading: Reading) -> Result<()> {
        match self.shard(reading.species()).try_send(Command::Reading(reading)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = PipelineError::BufferOverflow;
                self.metrics.record_rejected(err.reason());
                Err(err.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::Closed),
        }
    }

    /// Validate a raw record and enqueue it
    pub async fn push_record(&self, record: RawRecord) -> Result<()> {
        let reading = Reading::try_from(record).inspect_err(|e| {
            self.metrics.record_rejected(e.reason());
        })?;
        self.push(reading).await
    }

    /// Wait until every reading enqueued before this call has been processed
    pub async fn flush(&self) -> Result<()> {
        let mut replies = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            shard
                .send(Command::Flush(tx))
                .await
                .map_err(|_| GatewayError::Closed)?;
            replies.push(rx);
        }
        for reply in join_all(replies).await {
            reply.map_err(|_| GatewayError::Closed)?;
        }
        Ok(())
    }

    /// Return a species to OK and drop its window
    ///
    /// Ordered with readings: everything pushed earlier is processed first.
    pub async fn reset(&self, species: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.shard(species)
            .send(Command::Reset {
                species: species.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| GatewayError::Closed)?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    /// Per-species state, ordered by species
    pub fn status(&self) -> Vec<SpeciesStatus> {
        self.board.snapshot()
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Runs the shard tasks
pub struct PipelineRunner {
    shards: Vec<Shard>,
}

impl PipelineRunner {
    /// Run every shard until all [`ReadingSender`]s are dropped
    pub async fn run(self) {
        info!(shards = self.shards.len(), "Pipeline started");
        let handles: Vec<_> = self
            .shards
            .into_iter()
            .map(|shard| tokio::spawn(shard.run()))
            .collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Shard task failed");
            }
        }
        info!("Pipeline stopped");
    }
}
