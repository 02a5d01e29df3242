//! Bounded ring of the most recent readings

use outfall_core::Reading;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe ring buffer of readings for the status surface
///
/// When full, the oldest reading is dropped (FIFO eviction). Shards push
/// concurrently; the status server reads snapshots.
pub struct RecentReadings {
    readings: Mutex<VecDeque<Reading>>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl RecentReadings {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a reading; returns the new length
    pub fn push(&self, reading: Reading) -> usize {
        let mut buffer = self.readings.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(reading);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        buffer.len()
    }

    /// Up to `n` most recent readings, oldest first
    pub fn latest(&self, n: usize) -> Vec<Reading> {
        let buffer = self.readings.lock();
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn reading(i: usize) -> Reading {
        Reading::new("SO4", i as f64, i as f64).unwrap()
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let recent = RecentReadings::new(3);
        for i in 0..5 {
            recent.push(reading(i));
        }

        assert_eq!(recent.len(), 3);
        assert_eq!(recent.total_dropped(), 2);
        assert_eq!(recent.total_pushed(), 5);

        let kept: Vec<f64> = recent.latest(10).iter().map(Reading::timestamp).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_latest_returns_tail() {
        let recent = RecentReadings::new(100);
        for i in 0..50 {
            recent.push(reading(i));
        }
        let tail = recent.latest(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].timestamp(), 48.0);
        assert_eq!(tail[1].timestamp(), 49.0);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let recent = RecentReadings::new(0);
        recent.push(reading(1));
        assert_eq!(recent.capacity(), 1);
        assert_eq!(recent.len(), 1);
    }
}
