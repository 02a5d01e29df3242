//! Relay publishing with exponential backoff
//!
//! Wraps a [`RelayChannel`] to retry failed publishes with configurable
//! backoff and jitter.

use outfall_core::{FanOutMessage, PipelineError, RelayChannel};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lock-free xorshift64 PRNG for jitter randomness
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Random f64 in [0.0, 1.0)
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: std::sync::LazyLock<Xorshift64> = std::sync::LazyLock::new(Xorshift64::new);

fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth per retry
    pub multiplier: f64,
    /// Retries after the initial attempt (0 = try once)
    pub max_attempts: u32,
    /// Randomizes each delay by +/- this fraction
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 3,
            jitter_factor: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt `n` (attempt 0 is immediate)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_jitter(attempt, rand_jitter())
    }

    /// Delay with an explicit jitter sample in [0.0, 1.0]
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_us =
            self.initial_delay.as_micros() as f64 * self.multiplier.powi((attempt - 1) as i32);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        // jitter in [0, 1] maps to [-1, 1] of the jitter range
        let jitter_range = base_us * self.jitter_factor;
        let jitter_offset = (jitter * 2.0 - 1.0) * jitter_range;
        let final_us = (base_us + jitter_offset).max(1.0);

        Duration::from_micros(final_us as u64)
    }
}

/// Relay wrapper that retries failed publishes
pub struct RetryingRelay {
    inner: Arc<dyn RelayChannel>,
    config: BackoffConfig,
    retry_count: AtomicU64,
    recovered_count: AtomicU64,
}

impl RetryingRelay {
    pub fn new(inner: Arc<dyn RelayChannel>, config: BackoffConfig) -> Self {
        Self {
            inner,
            config,
            retry_count: AtomicU64::new(0),
            recovered_count: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<dyn RelayChannel> {
        &self.inner
    }

    /// Publish, retrying with backoff until success or attempts run out
    pub async fn publish(&self, message: &FanOutMessage) -> Result<(), PipelineError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                self.retry_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    relay = self.inner.name(),
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying relay publish"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.publish(message).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_count.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            relay = self.inner.name(),
                            attempt = attempt,
                            "relay publish recovered after retry"
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        relay = self.inner.name(),
                        attempt = attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "relay publish failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::FanOutRelay("all retries exhausted".into())))
    }

    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn recovered_count(&self) -> u64 {
        self.recovered_count.load(Ordering::Relaxed)
    }
}
