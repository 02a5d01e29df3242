//! Error taxonomy for the outfall pipeline

use thiserror::Error;

/// Error type shared by every pipeline stage
///
/// Per-record and per-connection variants are always local and non-fatal:
/// the offending record or message is rejected, a counter is incremented, and
/// the stream continues. Only [`PipelineError::Configuration`] is fatal, and
/// only at startup.
///
/// # Example
///
/// ```
/// use outfall_core::PipelineError;
///
/// let err = PipelineError::MessageTooLarge { size: 9000, limit: 8192 };
/// assert_eq!(err.reason(), "too_large");
/// assert!(!err.is_fatal());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Malformed or incomplete reading
    #[error("invalid reading: {0}")]
    Validation(String),

    /// Reading older than the species timeline allows
    #[error("out-of-order reading for '{species}': {timestamp} is older than {latest}")]
    OutOfOrder {
        species: String,
        timestamp: f64,
        latest: f64,
    },

    /// Client exhausted its token bucket
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Message above the configured byte cap
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Outbound queue full of critical messages, new message dropped
    #[error("outbound queue saturated, message dropped")]
    BufferOverflow,

    /// Connection closed because its queue stayed full past the grace period
    #[error("connection {0} disconnected as slow consumer")]
    SlowConsumerDisconnected(u64),

    /// Shared relay channel failure
    #[error("fan-out relay failed: {0}")]
    FanOutRelay(String),

    /// Missing or invalid permit / settings
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Short label used for metrics and structured logs
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::RateLimitExceeded => "rate_limited",
            Self::MessageTooLarge { .. } => "too_large",
            Self::BufferOverflow => "buffer_overflow",
            Self::SlowConsumerDisconnected(_) => "slow_consumer",
            Self::FanOutRelay(_) => "relay",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Whether the error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
