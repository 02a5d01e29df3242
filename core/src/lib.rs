//! outfall-core - Shared data model for the outfall compliance pipeline
//!
//! This crate holds the types that cross crate boundaries:
//!
//! - [`Reading`] / [`RawRecord`] - validated concentration samples and the raw feed shape
//! - [`Severity`] - closed, ordered alert levels
//! - [`Permit`] / [`PermitRule`] - per-species compliance rules
//! - [`AlertEvent`] / [`Envelope`] - transition events and the subscriber wire format
//! - [`FanOutMessage`] + [`RelayChannel`] - multi-instance relay contract
//! - [`PipelineError`] - error taxonomy shared by every stage
//!
//! Relay backends only need this crate, not the gateway:
//!
//! ```text
//! outfall-core ◄── outfall-gateway ◄── outfall-runtime
//!     ▲
//!     └────────── relay backends
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

mod error;
/// Alert events and the wire envelope
pub mod event;
/// Regulatory permit definitions
pub mod permit;
/// Readings and raw feed records
pub mod reading;
mod relay;
/// Alert severity levels
pub mod severity;

pub use error::PipelineError;
pub use event::{AlertEvent, Envelope, FanOutMessage, Topic};
pub use permit::{Permit, PermitRule};
pub use reading::{RawRecord, Reading};
pub use relay::{RelayChannel, RelaySubscription};
pub use severity::Severity;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==========================================================================
    // PipelineError Tests
    // ==========================================================================

    #[test]
    fn test_out_of_order_display() {
        let err = PipelineError::OutOfOrder {
            species: "SO4".to_string(),
            timestamp: 4.0,
            latest: 5.0,
        };
        assert_eq!(
            err.to_string(),
            "out-of-order reading for 'SO4': 4 is older than 5"
        );
        assert_eq!(err.reason(), "out_of_order");
    }

    #[test]
    fn test_slow_consumer_display() {
        let err = PipelineError::SlowConsumerDisconnected(7);
        assert_eq!(err.to_string(), "connection 7 disconnected as slow consumer");
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(PipelineError::Configuration("x".into()).is_fatal());
        assert!(!PipelineError::RateLimitExceeded.is_fatal());
        assert!(!PipelineError::BufferOverflow.is_fatal());
        assert!(!PipelineError::FanOutRelay("down".into()).is_fatal());
    }

    #[test]
    fn test_pipeline_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }

    // ==========================================================================
    // Severity Tests
    // ==========================================================================

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Ok < Severity::Watch);
        assert!(Severity::Watch < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(Severity::ALL.iter().max(), Some(&Severity::Critical));
    }

    #[test]
    fn test_severity_steps_down_one_level() {
        assert_eq!(Severity::Critical.step_down(), Severity::Warning);
        assert_eq!(Severity::Warning.step_down(), Severity::Watch);
        assert_eq!(Severity::Watch.step_down(), Severity::Ok);
        assert_eq!(Severity::Ok.step_down(), Severity::Ok);
    }

    #[test]
    fn test_severity_parse_and_display() {
        assert_eq!("WARNING".parse::<Severity>(), Ok(Severity::Warning));
        assert_eq!(Severity::Watch.to_string(), "watch");
        assert!("severe".parse::<Severity>().is_err());
    }

    // ==========================================================================
    // Relay Trait Tests
    // ==========================================================================

    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Relay that records publishes and never delivers
    struct CountingRelay {
        published: AtomicU64,
    }

    struct ClosedSubscription;

    #[async_trait]
    impl RelaySubscription for ClosedSubscription {
        async fn recv(&mut self) -> Result<Option<FanOutMessage>, PipelineError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl RelayChannel for CountingRelay {
        fn name(&self) -> &str {
            "counting"
        }

        async fn publish(&self, _message: &FanOutMessage) -> Result<(), PipelineError> {
            self.published.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn subscribe(&self) -> Box<dyn RelaySubscription> {
            Box::new(ClosedSubscription)
        }
    }

    #[tokio::test]
    async fn test_relay_is_object_safe() {
        let relay: Arc<dyn RelayChannel> = Arc::new(CountingRelay {
            published: AtomicU64::new(0),
        });
        let reading = Reading::new("Ni", 1.0, 0.2).unwrap();
        let msg = FanOutMessage {
            origin_instance_id: "a".into(),
            event_id: "1".into(),
            payload: Envelope::reading(&reading),
        };

        assert!(relay.publish(&msg).await.is_ok());
        assert_eq!(relay.name(), "counting");

        let mut sub = relay.subscribe();
        assert!(matches!(sub.recv().await, Ok(None)));
    }
}
