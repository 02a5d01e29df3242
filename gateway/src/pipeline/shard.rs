//! Pipeline shard: one task owning the window and alert state for a
//! subset of species

use super::StatusBoard;
use crate::alert::AlertStateMachine;
use crate::fanout::FanOutBridge;
use crate::hub::BroadcastHub;
use crate::metrics::MetricsRecorder;
use crate::recent::RecentReadings;
use crate::rules;
use crate::window::WindowTracker;
use outfall_core::{Envelope, Permit, Reading, Severity};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Work items delivered to a shard
pub(crate) enum Command {
    Reading(Reading),
    /// Reply once every earlier command has been processed
    Flush(oneshot::Sender<()>),
    Reset {
        species: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Collaborators shared by every shard
#[derive(Clone)]
pub(crate) struct ShardContext {
    pub permit: Arc<Permit>,
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<MetricsRecorder>,
    pub fanout: Option<Arc<FanOutBridge>>,
    pub recent: Option<Arc<RecentReadings>>,
    pub board: Arc<StatusBoard>,
    pub tolerance: f64,
}

pub(crate) struct Shard {
    index: usize,
    rx: mpsc::Receiver<Command>,
    windows: WindowTracker,
    alerts: AlertStateMachine,
    ctx: ShardContext,
}

impl Shard {
    pub(crate) fn new(index: usize, rx: mpsc::Receiver<Command>, ctx: ShardContext) -> Self {
        Self {
            index,
            rx,
            windows: WindowTracker::new(Arc::clone(&ctx.permit)).with_tolerance(ctx.tolerance),
            alerts: AlertStateMachine::new(Arc::clone(&ctx.permit)),
            ctx,
        }
    }

    /// Process commands until every sender is dropped
    pub(crate) async fn run(mut self) {
        debug!(shard = self.index, "Shard started");
        let mut processed: u64 = 0;

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Reading(reading) => {
                    self.process(reading);
                    processed += 1;
                }
                Command::Flush(reply) => {
                    let _ = reply.send(());
                }
                Command::Reset { species, reply } => {
                    let had_window = self.windows.reset(&species);
                    let had_alert = self.alerts.reset(&species);
                    self.ctx.board.remove(&species);
                    info!(shard = self.index, species = %species, "Species state reset");
                    let _ = reply.send(had_window || had_alert);
                }
            }
        }

        debug!(shard = self.index, processed, "Shard stopped");
    }

    /// Ingest, evaluate, transition, then publish reading and alert
    fn process(&mut self, reading: Reading) {
        let aggregate = match self.windows.ingest(&reading) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                self.ctx.metrics.record_rejected(e.reason());
                debug!(shard = self.index, reason = e.reason(), error = %e, "Reading rejected");
                return;
            }
        };
        self.ctx.metrics.record_ingested();

        let rule = self.ctx.permit.get(reading.species());
        let level = rules::evaluate(reading.value(), aggregate.average, rule);
        let event = self.alerts.transition(&reading, level, aggregate.average);

        if let Some(recent) = &self.ctx.recent {
            let len = recent.push(reading.clone());
            self.ctx.metrics.recent_buffer_len.set(len as i64);
        }

        self.deliver(Envelope::reading(&reading));

        if let Some(event) = event {
            self.ctx.metrics.record_alert(event.severity.as_str());
            if event.severity == Severity::Critical {
                warn!(
                    species = %event.species,
                    value = event.value,
                    threshold = event.threshold,
                    window_avg = event.window_avg,
                    "Critical exceedance"
                );
            } else {
                info!(
                    species = %event.species,
                    from = %event.previous,
                    to = %event.severity,
                    "Alert severity changed"
                );
            }
            self.deliver(Envelope::alert(&event));
        }

        self.ctx.board.update(
            reading.species(),
            self.alerts.state(reading.species()),
            aggregate,
            reading.timestamp(),
        );
    }

    fn deliver(&self, envelope: Envelope) {
        if let Some(fanout) = &self.ctx.fanout {
            if !fanout.publish_local(&envelope) {
                return;
            }
        }
        if let Err(e) = self.ctx.hub.publish(&envelope) {
            warn!(
                shard = self.index,
                species = %envelope.species,
                reason = e.reason(),
                error = %e,
                "Envelope not published"
            );
        }
    }
}
