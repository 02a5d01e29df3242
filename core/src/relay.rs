//! Relay channel trait for multi-instance fan-out
//!
//! A [`RelayChannel`] is the shared pub/sub medium cooperating instances use
//! to exchange [`FanOutMessage`]s. The gateway ships an in-process
//! implementation; networked backends implement the same two traits.

use crate::error::PipelineError;
use crate::event::FanOutMessage;
use async_trait::async_trait;

/// Publish side of a shared relay channel
///
/// # Implementation Requirements
///
/// - Implementations must be `Send + Sync` for use across async tasks
/// - `publish` delivers to every subscriber, the publisher's own
///   subscription included; receivers filter their own echoes
/// - Failures are reported as [`PipelineError::FanOutRelay`]
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Channel name, shared by every cooperating instance
    fn name(&self) -> &str;

    /// Publish one message to every subscriber
    async fn publish(&self, message: &FanOutMessage) -> Result<(), PipelineError>;

    /// Open a new subscription that sees messages published after this call
    fn subscribe(&self) -> Box<dyn RelaySubscription>;
}

/// Receive side of a relay subscription
#[async_trait]
pub trait RelaySubscription: Send {
    /// Next message, `Ok(None)` once the channel is closed
    ///
    /// Lossy backends report skipped messages as an error and keep going.
    async fn recv(&mut self) -> Result<Option<FanOutMessage>, PipelineError>;
}
