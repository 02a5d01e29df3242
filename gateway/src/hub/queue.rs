//! Bounded per-connection outbound queue
//!
//! Producers (publish) never block: when the queue is full the oldest
//! non-critical message is evicted, and if every queued message is critical
//! the new message is dropped instead. A single consumer (the connection's
//! writer task) awaits messages in FIFO order.

use bytes::Bytes;
use outfall_core::Topic;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

/// One serialized envelope waiting to be written
///
/// `payload` is shared by every queue the envelope was published to.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: Topic,
    pub critical: bool,
    pub payload: Bytes,
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended without loss
    Queued,
    /// Appended after evicting the oldest non-critical message
    EvictedOldest,
    /// Queue full of critical messages; the new message was dropped
    DroppedNew,
    /// Queue already closed
    Closed,
}

struct QueueInner {
    items: VecDeque<Outbound>,
    /// Set when the queue became full, cleared when the consumer makes room
    full_since: Option<Instant>,
    closed: bool,
}

/// Bounded FIFO with critical-aware eviction
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
    evicted: AtomicU64,
    dropped_new: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                full_since: None,
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
            dropped_new: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, item: Outbound) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return EnqueueOutcome::Closed;
        }

        let outcome = if inner.items.len() < self.capacity {
            inner.items.push_back(item);
            EnqueueOutcome::Queued
        } else if let Some(pos) = inner.items.iter().position(|m| !m.critical) {
            inner.items.remove(pos);
            inner.items.push_back(item);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            EnqueueOutcome::EvictedOldest
        } else {
            self.dropped_new.fetch_add(1, Ordering::Relaxed);
            EnqueueOutcome::DroppedNew
        };

        if inner.items.len() >= self.capacity && inner.full_since.is_none() {
            inner.full_since = Some(Instant::now());
        }
        drop(inner);

        if outcome != EnqueueOutcome::DroppedNew {
            self.notify.notify_one();
        }
        outcome
    }

    /// Await the next message; `None` once the queue is closed
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            if let Some(item) = self.try_pop_inner()? {
                return Some(item);
            }
            self.notify.notified().await;
        }
    }

    /// Take the next message if one is ready
    pub fn try_pop(&self) -> Option<Outbound> {
        self.try_pop_inner().flatten()
    }

    /// `None` = closed, `Some(None)` = empty
    fn try_pop_inner(&self) -> Option<Option<Outbound>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let item = inner.items.pop_front();
        if inner.items.len() < self.capacity {
            inner.full_since = None;
        }
        Some(item)
    }

    /// Close the queue and discard what is left; returns the discard count
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            inner.full_since = None;
            let n = inner.items.len();
            inner.items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    /// When the queue became continuously full, if it is full now
    pub fn full_since(&self) -> Option<Instant> {
        self.inner.lock().full_since
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted to make room
    pub fn total_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// New messages dropped because only critical messages were queued
    pub fn total_dropped_new(&self) -> u64 {
        self.dropped_new.load(Ordering::Relaxed)
    }

    /// Copy of the queued messages, oldest first
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Outbound> {
        self.inner.lock().items.iter().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(n: usize, critical: bool) -> Outbound {
        Outbound {
            topic: if critical { Topic::Alert } else { Topic::Reading },
            critical,
            payload: Bytes::from(n.to_string()),
        }
    }

    fn payloads(queue: &OutboundQueue) -> Vec<String> {
        queue
            .snapshot()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_non_critical() {
        let queue = OutboundQueue::new(10);
        let mut evicted = 0;
        for i in 0..15 {
            if queue.push(msg(i, false)) == EnqueueOutcome::EvictedOldest {
                evicted += 1;
            }
        }

        assert_eq!(evicted, 5);
        assert_eq!(queue.len(), 10);
        let expected: Vec<String> = (5..15).map(|i| i.to_string()).collect();
        assert_eq!(payloads(&queue), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_survives_while_non_critical_remain() {
        let queue = OutboundQueue::new(3);
        queue.push(msg(0, true));
        queue.push(msg(1, false));
        queue.push(msg(2, false));

        assert_eq!(queue.push(msg(3, false)), EnqueueOutcome::EvictedOldest);
        assert_eq!(payloads(&queue), vec!["0", "2", "3"]);

        assert_eq!(queue.push(msg(4, true)), EnqueueOutcome::EvictedOldest);
        assert_eq!(payloads(&queue), vec!["0", "3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_critical_drops_new() {
        let queue = OutboundQueue::new(2);
        queue.push(msg(0, true));
        queue.push(msg(1, true));

        assert_eq!(queue.push(msg(2, true)), EnqueueOutcome::DroppedNew);
        assert_eq!(queue.push(msg(3, false)), EnqueueOutcome::DroppedNew);
        assert_eq!(payloads(&queue), vec!["0", "1"]);
        assert_eq!(queue.total_dropped_new(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_since_tracks_continuous_fullness() {
        let queue = OutboundQueue::new(2);
        queue.push(msg(0, false));
        assert!(queue.full_since().is_none());

        queue.push(msg(1, false));
        let since = queue.full_since().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        queue.push(msg(2, false));
        // Still the original instant
        assert_eq!(queue.full_since(), Some(since));

        queue.try_pop().unwrap();
        assert!(queue.full_since().is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(msg(7, false));

        let item = consumer.await.unwrap().unwrap();
        assert_eq!(item.payload, Bytes::from("7"));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        for i in 0..3 {
            queue.push(msg(i, false));
        }
        for i in 0..3 {
            assert_eq!(queue.pop().await.unwrap().payload, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_close_discards_and_wakes_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        queue.push(msg(0, false));
        queue.push(msg(1, false));
        assert_eq!(queue.close(), 2);
        assert_eq!(queue.close(), 0);

        assert!(queue.pop().await.is_none());
        assert_eq!(queue.push(msg(2, false)), EnqueueOutcome::Closed);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
