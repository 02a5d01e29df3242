//! In-process relay channel
//!
//! Messages travel as JSON bytes over a tokio broadcast channel, so the
//! in-process relay exercises the same wire encoding a networked backend
//! would. Clones share the channel: every pipeline holding a clone of the
//! same `MemoryRelay` is a cooperating instance.

use async_trait::async_trait;
use bytes::Bytes;
use outfall_core::{FanOutMessage, PipelineError, RelayChannel, RelaySubscription};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of in-flight messages per subscriber
pub const DEFAULT_RELAY_CAPACITY: usize = 1024;

/// Named in-process broadcast relay
#[derive(Clone)]
pub struct MemoryRelay {
    name: Arc<str>,
    tx: broadcast::Sender<Bytes>,
}

impl MemoryRelay {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_RELAY_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name: Arc::from(name.into()),
            tx,
        }
    }

    /// Current number of subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: &FanOutMessage) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| PipelineError::FanOutRelay(format!("encode: {e}")))?;
        // No subscribers is not an error for a pub/sub channel
        let _ = self.tx.send(Bytes::from(bytes));
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn RelaySubscription> {
        Box::new(MemorySubscription {
            rx: self.tx.subscribe(),
        })
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl RelaySubscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<FanOutMessage>, PipelineError> {
        match self.rx.recv().await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::FanOutRelay(format!("decode: {e}"))),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(PipelineError::FanOutRelay(
                format!("subscription lagged, {n} messages skipped"),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use outfall_core::{Envelope, Reading};

    fn message(id: &str) -> FanOutMessage {
        FanOutMessage {
            origin_instance_id: "a".into(),
            event_id: id.into(),
            payload: Envelope::reading(&Reading::new("Ni", 1.0, 0.05).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let relay = MemoryRelay::new("effluent");
        let mut s1 = relay.subscribe();
        let mut s2 = relay.clone().subscribe();
        assert_eq!(relay.subscriber_count(), 2);

        relay.publish(&message("e1")).await.unwrap();

        assert_eq!(s1.recv().await.unwrap().unwrap().event_id, "e1");
        assert_eq!(s2.recv().await.unwrap().unwrap(), message("e1"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let relay = MemoryRelay::new("empty");
        assert!(relay.publish(&message("e1")).await.is_ok());
        assert_eq!(relay.name(), "empty");
    }

    #[tokio::test]
    async fn test_lag_reported_then_continues() {
        let relay = MemoryRelay::with_capacity("small", 2);
        let mut sub = relay.subscribe();
        for i in 0..4 {
            relay.publish(&message(&format!("e{i}"))).await.unwrap();
        }

        assert!(matches!(sub.recv().await, Err(PipelineError::FanOutRelay(_))));
        assert_eq!(sub.recv().await.unwrap().unwrap().event_id, "e2");
    }

    #[tokio::test]
    async fn test_closed_when_all_senders_dropped() {
        let relay = MemoryRelay::new("gone");
        let mut sub = relay.subscribe();
        drop(relay);
        assert!(sub.recv().await.unwrap().is_none());
    }
}
