//! Token bucket with lazy refill.
//!
//! A [`TokenBucket`] holds up to `capacity` tokens and regains `refill_rate` tokens per
//! second. There is no background timer: every operation first credits the tokens earned
//! since the previous operation, then decides. Refill and decision happen under one lock so
//! two callers can never both spend the same token.
//!
//! ```
//! use tollgate::TokenBucket;
//!
//! let bucket = TokenBucket::new(2, 1.0).unwrap();
//! assert!(bucket.allow());
//! assert!(bucket.allow());
//! assert!(!bucket.allow());
//! assert!(bucket.retry_after() > std::time::Duration::ZERO);
//! ```

use crate::clock::{default_clock, Clock, SharedClock};
use crate::RateLimitError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Immutable bucket policy: burst size and steady refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    capacity: u64,
    refill_rate: f64,
}

impl BucketConfig {
    /// Create a validated config. Both values must be strictly positive.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self, RateLimitError> {
        let cfg = Self { capacity, refill_rate };
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn validate(&self) -> Result<(), RateLimitError> {
        if self.capacity == 0 {
            return Err(RateLimitError::InvalidCapacity { provided: self.capacity });
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(RateLimitError::InvalidRefillRate { provided: self.refill_rate });
        }
        Ok(())
    }

    /// Maximum tokens a bucket may hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens regained per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Persistable `{tokens, last_refill}` record for a bucket.
///
/// `last_refill_nanos` is a reading of the bucket's [`Clock`]; it is only meaningful to
/// buckets sharing that clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Fractional token count at `last_refill_nanos`.
    pub tokens: f64,
    /// Clock reading of the last refill.
    pub last_refill_nanos: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_nanos: u64,
}

impl BucketState {
    /// Credit tokens earned since the last refill, capped at `capacity`.
    fn refill(&mut self, now: u64, capacity: f64, refill_rate: f64) {
        let elapsed_secs = now.saturating_sub(self.last_refill_nanos) as f64 / NANOS_PER_SEC;
        self.tokens = (self.tokens + elapsed_secs * refill_rate).min(capacity);
        self.last_refill_nanos = self.last_refill_nanos.max(now);
    }

    /// Whole milliseconds until `needed` tokens are available, rounded up.
    fn wait_for(&self, needed: f64, refill_rate: f64) -> Duration {
        if self.tokens >= needed {
            return Duration::ZERO;
        }
        let millis = ((needed - self.tokens) / refill_rate * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }
}

/// Outcome of [`TokenBucket::acquire`]: the decision plus the balance it left behind,
/// all read under the same lock. For a denial of `n` tokens, `retry_after` is the wait
/// until `n` tokens are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Whether the tokens were consumed.
    pub allowed: bool,
    /// Whole tokens left afterwards.
    pub remaining: u64,
    /// Advisory wait before retrying; zero when allowed.
    pub retry_after: Duration,
}

/// Single-key token bucket.
///
/// All state transitions go through the internal lock; the bucket is safe to share via
/// `Arc` across threads.
#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
    clock: SharedClock,
}

impl TokenBucket {
    /// Create a full bucket. Errors if `capacity == 0` or `refill_rate <= 0`.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self, RateLimitError> {
        Ok(Self::from_config(BucketConfig::new(capacity, refill_rate)?))
    }

    /// Create a full bucket from an already validated config.
    pub fn from_config(config: BucketConfig) -> Self {
        Self::with_shared_clock(config, default_clock())
    }

    /// Override the clock (useful for deterministic tests). Resets the refill basis to the
    /// new clock's current reading.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        let now = self.clock.now_nanos();
        self.lock().last_refill_nanos = now;
        self
    }

    pub(crate) fn with_shared_clock(config: BucketConfig, clock: SharedClock) -> Self {
        let now = clock.now_nanos();
        Self {
            config,
            state: Mutex::new(BucketState { tokens: config.capacity as f64, last_refill_nanos: now }),
            clock,
        }
    }

    /// Rebuild a bucket from a persisted snapshot. Token counts outside `0..=capacity`
    /// are clamped.
    pub fn restore(
        config: BucketConfig,
        snapshot: BucketSnapshot,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        let tokens = if snapshot.tokens.is_finite() {
            snapshot.tokens.clamp(0.0, config.capacity as f64)
        } else {
            0.0
        };
        Ok(Self {
            config,
            state: Mutex::new(BucketState { tokens, last_refill_nanos: snapshot.last_refill_nanos }),
            clock,
        })
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Consume `n` tokens if at least `n` are available after refill; otherwise leave the
    /// (refilled) balance untouched. `n == 0` always succeeds without consuming.
    pub fn allow_n(&self, n: u64) -> bool {
        let mut state = self.refilled();
        Self::take(&mut state, n)
    }

    /// Like [`allow_n`](Self::allow_n), also reporting the remaining balance and, for a
    /// denial, the advisory wait.
    pub fn acquire(&self, n: u64) -> Acquisition {
        let mut state = self.refilled();
        let allowed = Self::take(&mut state, n);
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            state.wait_for(n.max(1) as f64, self.config.refill_rate)
        };
        Acquisition { allowed, remaining: state.tokens.floor() as u64, retry_after }
    }

    /// Whole tokens currently available (refills first).
    pub fn remaining(&self) -> u64 {
        self.refilled().tokens.floor() as u64
    }

    /// Fractional token balance (refills first).
    pub fn available(&self) -> f64 {
        self.refilled().tokens
    }

    /// Advisory wait until one token is available; zero if one is available now.
    ///
    /// Rounded up to whole milliseconds.
    pub fn retry_after(&self) -> Duration {
        self.refilled().wait_for(1.0, self.config.refill_rate)
    }

    /// Maximum tokens this bucket holds.
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Tokens regained per second.
    pub fn refill_rate(&self) -> f64 {
        self.config.refill_rate
    }

    /// Policy this bucket was created with.
    pub fn config(&self) -> BucketConfig {
        self.config
    }

    /// Refill and capture the persistable state.
    pub fn snapshot(&self) -> BucketSnapshot {
        let state = self.refilled();
        BucketSnapshot { tokens: state.tokens, last_refill_nanos: state.last_refill_nanos }
    }

    fn take(state: &mut BucketState, n: u64) -> bool {
        let cost = n as f64;
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let now = self.clock.now_nanos();
        let mut state = self.lock();
        state.refill(now, self.config.capacity as f64, self.config.refill_rate);
        state
    }

    // Every mutation is a plain assignment, so a poisoned guard still holds a valid state.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
