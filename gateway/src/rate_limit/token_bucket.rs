//! Lock-free token bucket with continuous refill
//!
//! Thread-safe using atomics only, no locks on the hot path. Time comes from
//! `tokio::time::Instant` so paused-clock tests are deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Internal scale: 1000 milli-tokens = 1 token
const SCALE: u64 = 1000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Lock-free token bucket
///
/// Holds up to `burst` tokens and refills continuously at `rate` tokens per
/// second with milli-token resolution. Fractional refill carries over between
/// calls, so slow refill rates are not rounded away.
pub(crate) struct TokenBucket {
    /// Max tokens (scaled by 1000)
    capacity: u64,
    /// Milli-tokens added per second
    rate_milli: u64,
    /// Current token count (scaled by 1000)
    tokens: AtomicU64,
    /// Last refill timestamp (nanos since `start`)
    last_refill: AtomicU64,
    /// Anchor instant for elapsed time
    start: Instant,
}

impl TokenBucket {
    /// * `rate` - tokens per second (0 = no refill)
    /// * `burst` - capacity; 0 rejects everything
    pub(crate) fn new(rate: f64, burst: u32) -> Self {
        let rate_milli = if rate.is_finite() && rate > 0.0 {
            (rate * SCALE as f64).round() as u64
        } else {
            0
        };
        let capacity = u64::from(burst).saturating_mul(SCALE);

        Self {
            capacity,
            rate_milli,
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Try to take one token
    pub(crate) fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current < SCALE {
                return false;
            }

            if self
                .tokens
                .compare_exchange_weak(current, current - SCALE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Tokens currently available (fractional)
    pub(crate) fn available(&self) -> f64 {
        self.refill();
        self.tokens.load(Ordering::Acquire) as f64 / SCALE as f64
    }

    fn refill(&self) {
        if self.rate_milli == 0 {
            return;
        }
        let now_nanos = self.start.elapsed().as_nanos() as u64;

        loop {
            let last = self.last_refill.load(Ordering::Acquire);
            let elapsed = u128::from(now_nanos.saturating_sub(last));

            let added = elapsed * u128::from(self.rate_milli) / NANOS_PER_SEC;
            if added == 0 {
                return;
            }
            // Advance only by the time actually converted into milli-tokens
            let consumed = (added * NANOS_PER_SEC / u128::from(self.rate_milli)) as u64;
            let new_last = last + consumed;

            match self.last_refill.compare_exchange_weak(
                last,
                new_last,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let added = u64::try_from(added).unwrap_or(u64::MAX);
                    loop {
                        let current = self.tokens.load(Ordering::Acquire);
                        let new_tokens = current.saturating_add(added).min(self.capacity);
                        if current == new_tokens {
                            break;
                        }
                        if self
                            .tokens
                            .compare_exchange_weak(
                                current,
                                new_tokens,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            break;
                        }
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }
}
