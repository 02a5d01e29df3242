//! Inbound guards
//!
//! Every client message first passes the size cap, then costs one token
//! from the connection's bucket. Oversized messages never consume tokens.
//! [`KeyedRateLimiter`] applies the same bucket per HTTP client.

mod keyed;
mod token_bucket;

pub use keyed::KeyedRateLimiter;

use outfall_core::PipelineError;
use token_bucket::TokenBucket;

/// Token-bucket throttle plus message-size guard for one connection
pub struct RateLimiter {
    bucket: TokenBucket,
    max_message_bytes: usize,
}

impl RateLimiter {
    /// # Arguments
    /// * `rate` - sustained messages per second
    /// * `burst` - bucket capacity
    /// * `max_message_bytes` - inbound size cap
    pub fn new(rate: f64, burst: u32, max_message_bytes: usize) -> Self {
        Self {
            bucket: TokenBucket::new(rate, burst),
            max_message_bytes,
        }
    }

    /// Admit one inbound message of `len` bytes
    pub fn check(&self, len: usize) -> Result<(), PipelineError> {
        if len > self.max_message_bytes {
            return Err(PipelineError::MessageTooLarge {
                size: len,
                limit: self.max_message_bytes,
            });
        }
        if !self.bucket.try_acquire() {
            return Err(PipelineError::RateLimitExceeded);
        }
        Ok(())
    }

    /// Tokens currently in the bucket
    pub fn available(&self) -> f64 {
        self.bucket.available()
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new(1.0, 3, 1024);
        for _ in 0..3 {
            assert!(limiter.check(10).is_ok());
        }
        assert_eq!(limiter.check(10), Err(PipelineError::RateLimitExceeded));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check(10).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_does_not_consume_token() {
        let limiter = RateLimiter::new(0.0, 1, 16);
        let err = limiter.check(17).unwrap_err();
        assert_eq!(err, PipelineError::MessageTooLarge { size: 17, limit: 16 });
        assert_eq!(limiter.available(), 1.0);
        // The single token is still there
        assert!(limiter.check(16).is_ok());
        assert!(limiter.check(1).is_err());
    }
}
