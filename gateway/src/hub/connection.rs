//! Subscriber connection state

use super::queue::OutboundQueue;
use crate::rate_limit::RateLimiter;
use outfall_core::{PipelineError, Topic};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Hub-assigned connection identifier
pub type ConnectionId = u64;

/// One registered subscriber
///
/// Created by [`BroadcastHub::register`](super::BroadcastHub::register) and
/// owned by the hub; transport tasks hold an `Arc` only while the connection
/// is open.
pub struct Connection {
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
    limiter: RateLimiter,
    authenticated: bool,
    topics: RwLock<BTreeSet<Topic>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        queue_capacity: usize,
        limiter: RateLimiter,
        authenticated: bool,
    ) -> Self {
        Self {
            id,
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            limiter,
            authenticated,
            topics: RwLock::new(Topic::ALL.into_iter().collect()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Outbound queue drained by the writer task
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Admit one inbound client message (size cap, then one token)
    pub fn admit(&self, len: usize) -> Result<(), PipelineError> {
        self.limiter.check(len)
    }

    pub fn subscribe(&self, topics: &[Topic]) {
        self.topics.write().extend(topics.iter().copied());
    }

    pub fn unsubscribe(&self, topics: &[Topic]) {
        let mut current = self.topics.write();
        for topic in topics {
            current.remove(topic);
        }
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.topics.read().contains(&topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.read().iter().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
            evicted: self.queue.total_evicted(),
            dropped: self.queue.total_dropped_new(),
            full_for_ms: self
                .queue
                .full_since()
                .map(|since| since.elapsed().as_millis() as u64),
            topics: self.topics(),
            authenticated: self.authenticated,
            tokens_available: self.limiter.available(),
        }
    }
}

/// Per-connection occupancy snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub queued: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub dropped: u64,
    pub full_for_ms: Option<u64>,
    pub topics: Vec<Topic>,
    pub authenticated: bool,
    pub tokens_available: f64,
}
