//! Outfall runtime - process bootstrap for the compliance gateway
//!
//! Provides [`run()`] for zero-boilerplate startup, and [`RuntimeBuilder`]
//! for callers that need to override addresses, the permit or the relay.
//!
//! # Quick start
//!
//! ```ignore
//! use outfall_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     outfall_runtime::run(|sender| async move {
//!         sender.push(Reading::new("As", 0.0, 0.004)?).await?;
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use outfall_core::{Permit, RelayChannel};
use outfall_gateway::auth::{self, AuthGate};
use outfall_gateway::config::{Config, LogFormat};
use outfall_gateway::fanout::{FanOutBridge, FanOutConfig, MemoryRelay};
use outfall_gateway::hub::{BroadcastHub, HubConfig};
use outfall_gateway::metrics::MetricsRecorder;
use outfall_gateway::metrics_server::{StatusServer, StatusState};
use outfall_gateway::pipeline::{Pipeline, ReadingSender};
use outfall_gateway::recent::RecentReadings;
use outfall_gateway::server::{SessionConfig, SubscriberServer};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long shutdown waits for each background task
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the gateway with settings from the environment.
///
/// Loads configuration, initialises tracing, wires the pipeline, hub,
/// fan-out and both HTTP servers, then hands a [`ReadingSender`] to `feed`.
/// Serving continues after `feed` returns, until SIGINT or SIGTERM.
pub async fn run<F, Fut>(feed: F) -> anyhow::Result<()>
where
    F: FnOnce(ReadingSender) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    RuntimeBuilder::new().run(feed).await
}

/// Power-user builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .listen_addr("0.0.0.0:8081".parse()?)
///     .permit(Permit::from_json(&std::fs::read_to_string("permit.json")?)?)
///     .run(|sender| async move { Ok(()) })
///     .await
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    listen_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
    permit: Option<Permit>,
    relay: Option<Arc<dyn RelayChannel>>,
    install_tracing: bool,
}

impl RuntimeBuilder {
    /// Create a new builder; unset values come from `OUTFALL_*` variables.
    pub fn new() -> Self {
        Self {
            install_tracing: true,
            ..Self::default()
        }
    }

    /// Override the WebSocket listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Override the status/metrics listen address.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Use this permit instead of `OUTFALL_PERMIT_FILE` / the built-in one.
    pub fn permit(mut self, permit: Permit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Relay to peer instances over this channel.
    ///
    /// Without it, `OUTFALL_RELAY_CHANNEL` selects an in-process relay.
    pub fn relay(mut self, relay: Arc<dyn RelayChannel>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Leave the global tracing subscriber to the caller.
    pub fn without_tracing(mut self) -> Self {
        self.install_tracing = false;
        self
    }

    /// Wire everything and run to completion.
    ///
    /// This is the terminal method; it returns after shutdown.
    pub async fn run<F, Fut>(self, feed: F) -> anyhow::Result<()>
    where
        F: FnOnce(ReadingSender) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ── 1. Load config from env ──────────────────────────────
        let mut config = Config::from_env()?;
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }

        // ── 2. Init tracing ──────────────────────────────────────
        if self.install_tracing {
            init_tracing(&config);
        }

        // ── 3. Permit ────────────────────────────────────────────
        let permit = match self.permit {
            Some(permit) => {
                permit.validate()?;
                permit
            }
            None => config.load_permit()?,
        };
        let permit = Arc::new(permit);

        info!(
            listen_addr = %config.listen_addr,
            metrics_addr = %config.metrics_addr,
            instance = %config.instance_id,
            species = permit.len(),
            shards = config.shards,
            "Starting outfall"
        );

        // ── 4. Shared state ──────────────────────────────────────
        let metrics = Arc::new(MetricsRecorder::new()?);
        let hub = Arc::new(BroadcastHub::new(
            HubConfig::from_config(&config),
            Arc::clone(&metrics),
        ));
        let recent = Arc::new(RecentReadings::new(config.recent_capacity));

        // ── 5. Fan-out ───────────────────────────────────────────
        let relay = self.relay.or_else(|| {
            config.relay_channel.as_deref().map(|name| {
                warn!(channel = name, "Using in-process relay; peers must share this process");
                Arc::new(MemoryRelay::new(name)) as Arc<dyn RelayChannel>
            })
        });

        let mut pipeline = Pipeline::new(Arc::clone(&permit), Arc::clone(&hub), Arc::clone(&metrics))
            .shards(config.shards)
            .channel_capacity(config.channel_capacity)
            .out_of_order_tolerance(config.out_of_order_tolerance)
            .recent(Arc::clone(&recent));

        let mut fanout_handle = None;
        if let Some(relay) = relay {
            info!(relay = relay.name(), "Fan-out enabled");
            let (bridge, runner) = FanOutBridge::new(
                relay,
                FanOutConfig::new(config.instance_id.clone()).dedup_window(config.dedup_window),
                Arc::clone(&hub),
                Arc::clone(&metrics),
            );
            pipeline = pipeline.fanout(bridge);
            fanout_handle = Some(tokio::spawn(runner.run()));
        }

        // ── 6. Build and spawn the pipeline ──────────────────────
        let (sender, runner) = pipeline.build();
        let pipeline_handle = tokio::spawn(runner.run());

        // ── 7. HTTP servers ──────────────────────────────────────
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let api_gate = AuthGate::new(
            auth::from_secret(config.api_token.as_deref()),
            Arc::clone(&metrics),
        );

        let status_state = StatusState::new(
            &config.instance_id,
            Arc::clone(&hub),
            Arc::clone(&metrics),
            Arc::clone(&recent),
            Arc::clone(sender.board()),
            Arc::clone(&permit),
        );
        let readiness = status_state.readiness();
        let mut status_server = StatusServer::new(status_state, api_gate.clone())
            .api_rate_limit(config.api_rate_per_sec);
        if config.protect_metrics {
            let gate = AuthGate::new(
                auth::from_secret(config.effective_metrics_token()),
                Arc::clone(&metrics),
            );
            status_server = status_server.protect_metrics(gate);
        }
        let status_handle =
            status_server.start(config.metrics_addr, wait_for(shutdown_rx.clone()));

        let subscriber_handle = SubscriberServer::new(Arc::clone(&hub), api_gate, Arc::clone(&metrics))
            .ingest(sender.clone())
            .session(SessionConfig {
                heartbeat_interval: config.heartbeat_interval,
                idle_timeout: config.idle_timeout,
            })
            .start(config.listen_addr, wait_for(shutdown_rx.clone()));

        // ── 8. Slow-consumer sweep ───────────────────────────────
        let sweep_handle = spawn_sweep(
            Arc::clone(&hub),
            config.slow_consumer_grace,
            shutdown_rx.clone(),
        );

        readiness.set_ready(true);

        // ── 9. Caller's feed ─────────────────────────────────────
        let feed_handle = tokio::spawn(feed(sender.clone()));
        let feed_abort = feed_handle.abort_handle();
        let feed_watch = tokio::spawn(async move {
            match feed_handle.await {
                Ok(Ok(())) => info!("Feed finished"),
                Ok(Err(e)) => error!(error = %e, "Feed failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Feed task panicked"),
            }
        });

        shutdown_signal().await;

        // ── 10. Shutdown ─────────────────────────────────────────
        readiness.set_ready(false);
        let _ = shutdown_tx.send(true);
        feed_abort.abort();
        feed_watch.abort();
        hub.close_all();
        drop(sender);

        drain("pipeline", pipeline_handle).await;
        if let Some(handle) = fanout_handle {
            drain("fan-out", handle).await;
        }
        drain("sweep", sweep_handle).await;
        drain("subscriber server", subscriber_handle).await;
        drain("status server", status_handle).await;

        info!("Outfall shutdown complete");
        Ok(())
    }
}

/// Resolve once shutdown is signalled (or the sender is gone)
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Periodically force-close connections stuck past the grace period
fn spawn_sweep(
    hub: Arc<BroadcastHub>,
    grace: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = (grace / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let stop = wait_for(shutdown);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = hub.evict_slow_consumers();
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "Slow-consumer sweep closed connections");
                    }
                }
                _ = &mut stop => return,
            }
        }
    })
}

/// Await a background task, giving up after [`DRAIN_TIMEOUT`]
async fn drain(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = name, error = %e, "Task failed during shutdown"),
        Err(_) => warn!(task = name, "Task did not stop in time"),
    }
}

/// Initialise the tracing subscriber based on config.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
