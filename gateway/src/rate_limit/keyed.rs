//! Per-client request limiter for the HTTP status API

use super::RateLimiter;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Distinct clients tracked before idle buckets are pruned
const DEFAULT_MAX_KEYS: usize = 4096;

/// One [`RateLimiter`] per client key, created on first use
///
/// Keys are opaque; the status server uses `ip + path`. When the map grows
/// past `max_keys`, buckets that have refilled completely are forgotten since
/// a fresh bucket behaves the same.
pub struct KeyedRateLimiter {
    per_sec: f64,
    burst: u32,
    max_keys: usize,
    limiters: Mutex<HashMap<String, RateLimiter>>,
}

impl KeyedRateLimiter {
    /// Allow `per_sec` requests per second per key, bursting to the same amount
    pub fn per_second(per_sec: u32) -> Self {
        Self {
            per_sec: f64::from(per_sec),
            burst: per_sec,
            max_keys: DEFAULT_MAX_KEYS,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }

    /// Take one request token for `key`
    pub fn check(&self, key: &str) -> bool {
        let mut limiters = self.limiters.lock();
        if !limiters.contains_key(key) && limiters.len() >= self.max_keys {
            let full = f64::from(self.burst);
            limiters.retain(|_, limiter| limiter.available() < full);
        }
        limiters
            .entry(key.to_string())
            .or_insert_with(|| RateLimiter::new(self.per_sec, self.burst, usize::MAX))
            .check(0)
            .is_ok()
    }

    /// Keys currently tracked
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = KeyedRateLimiter::per_second(2);
        assert!(limiter.check("10.0.0.1 /api/status"));
        assert!(limiter.check("10.0.0.1 /api/status"));
        assert!(!limiter.check("10.0.0.1 /api/status"));

        assert!(limiter.check("10.0.0.2 /api/status"));
        assert!(limiter.check("10.0.0.1 /api/streams"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("10.0.0.1 /api/status"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_keys_pruned_at_capacity() {
        let limiter = KeyedRateLimiter::per_second(1).max_keys(2);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert_eq!(limiter.len(), 2);

        // Both buckets refill, so both are dropped to make room for c
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.check("c"));
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_keys_survive_pruning() {
        let limiter = KeyedRateLimiter::per_second(1).max_keys(1);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        // a is still drained, so the pruning pass kept it
        assert_eq!(limiter.len(), 2);
        assert!(!limiter.check("a"));
    }
}
