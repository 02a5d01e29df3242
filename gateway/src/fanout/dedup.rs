//! Time-windowed event id tracking
//!
//! Remembers every event id seen within the de-dup window, whether it was
//! published locally or received from the relay. Thread-safe using a
//! parking_lot mutex; expired ids are purged every `cleanup_interval` checks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Time-windowed set of event ids
pub struct SeenIds {
    /// id -> first seen
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    ops_since_cleanup: AtomicU32,
    cleanup_interval: u32,
    duplicates: AtomicU64,
}

impl SeenIds {
    /// Cleanup every 1000 checks
    pub fn new(ttl: Duration) -> Self {
        Self::with_cleanup_interval(ttl, 1000)
    }

    pub fn with_cleanup_interval(ttl: Duration, cleanup_interval: u32) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            ops_since_cleanup: AtomicU32::new(0),
            cleanup_interval: cleanup_interval.max(1),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record `id`; true if it was not seen within the window
    pub fn check(&self, id: &str) -> bool {
        let now = Instant::now();

        let ops = self.ops_since_cleanup.fetch_add(1, Ordering::Relaxed);
        if ops >= self.cleanup_interval
            && self
                .ops_since_cleanup
                .compare_exchange(ops + 1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.cleanup(now);
        }

        let mut seen = self.seen.lock();
        #[allow(clippy::collapsible_if)]
        if let Some(first_seen) = seen.get(id) {
            if now.duration_since(*first_seen) < self.ttl {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        seen.insert(id.to_string(), now);
        true
    }

    fn cleanup(&self, now: Instant) {
        let ttl = self.ttl;
        self.seen
            .lock()
            .retain(|_, first_seen| now.duration_since(*first_seen) < ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Duplicates rejected so far
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}
