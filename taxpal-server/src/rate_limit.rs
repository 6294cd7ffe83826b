use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::config::RateLimitConfig;

/// Process-wide token bucket shared by every chat request.
///
/// Tokens accumulate continuously at `refill_rate` per second up to
/// `max_tokens`. Refilling happens lazily inside [`TokenBucket::try_acquire`];
/// there is no background timer.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_tokens: f64,
    refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, refill_rate: f64, max_tokens: f64) {
        // A clock reading older than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).clamp(0.0, max_tokens);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    fn starting_at(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.max_tokens,
                last_refill: now,
            }),
            max_tokens: config.max_tokens,
            refill_rate: config.refill_per_sec,
        }
    }

    /// Admit one request if a whole token is available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Refill up to `now`, then spend a token if one is available. The whole
    /// sequence runs under a single lock so concurrent callers never double
    /// spend.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.refill(now, self.refill_rate, self.max_tokens);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`, after refilling.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        state.refill(now, self.refill_rate, self.max_tokens);
        state.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The critical section cannot panic half-way, so a poisoned guard
        // still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
