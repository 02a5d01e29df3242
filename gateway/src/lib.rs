//! Outfall gateway - streaming effluent compliance pipeline
//!
//! Turns a feed of concentration readings into rolling-window aggregates,
//! threshold levels and hysteresis-filtered alerts, then broadcasts readings
//! and alerts to WebSocket subscribers with bounded per-connection queues.
//!
//! ```text
//! readings ──► shards (window ─► rules ─► alert) ──► BroadcastHub ──► subscribers
//!                                 │                       ▲
//!                                 └──► FanOutBridge ◄─────┘ (peer instances)
//! ```
//!
//! Every stateful component is owned explicitly and handed around as an
//! `Arc`; there are no process-wide singletons.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod alert;
pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod rate_limit;
pub mod recent;
pub mod rules;
pub mod server;
pub mod window;

pub use alert::{AlertState, AlertStateMachine};
pub use auth::{AllowAll, AuthGate, Authenticator, SharedSecret};
pub use config::{Config, LogFormat};
pub use error::{GatewayError, Result};
pub use fanout::{BackoffConfig, FanOutBridge, FanOutConfig, FanOutRunner, MemoryRelay, event_id};
pub use hub::{BroadcastHub, Connection, ConnectionId, ConnectionStatus, HubConfig, PublishReport};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use metrics_server::{Readiness, StatusServer, StatusState};
pub use pipeline::{Pipeline, PipelineRunner, ReadingSender, SpeciesStatus, StatusBoard};
pub use rate_limit::{KeyedRateLimiter, RateLimiter};
pub use recent::RecentReadings;
pub use server::{SessionConfig, SubscriberServer};
pub use window::{WindowAggregate, WindowTracker};

// Core types, so most users only need this crate
pub use outfall_core::{
    AlertEvent, Envelope, FanOutMessage, Permit, PermitRule, PipelineError, RawRecord, Reading,
    RelayChannel, RelaySubscription, Severity, Topic,
};
