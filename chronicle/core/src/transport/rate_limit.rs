//! Envelope rate limiting
//!
//! Token bucket per stream:
//! - Tokens refill at `envelopes_per_second`
//! - Up to `burst_size` tokens accumulate
//! - Each envelope consumes one token
//! - With no token available the sender waits; nothing is dropped
//!
//! Throttling is reported as a `warn!` on target `chronicle::rate_limit`
//! when a stream starts being throttled, and counted in [`RateLimitStats`].
//!
//! ```
//! use chronicle_core::transport::rate_limit::{EnvelopeRateLimiter, RateLimitConfig};
//!
//! let limiter = EnvelopeRateLimiter::new(
//!     RateLimitConfig::new()
//!         .with_envelopes_per_second(50)
//!         .with_burst_size(25),
//! );
//! assert!(limiter.check().is_allowed());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Token bucket configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state envelopes per second
    pub envelopes_per_second: u32,

    /// Maximum tokens that can accumulate
    pub burst_size: u32,

    /// Whether limiting is applied at all
    pub enabled: bool,

    /// Shortest wait when throttled (milliseconds)
    pub min_throttle_delay_ms: u64,

    /// Longest single wait when throttled (milliseconds)
    pub max_throttle_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            envelopes_per_second: 100,
            burst_size: 50,
            enabled: true,
            min_throttle_delay_ms: 10,
            max_throttle_delay_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the steady-state rate
    #[must_use]
    pub fn with_envelopes_per_second(mut self, rate: u32) -> Self {
        self.envelopes_per_second = rate;
        self
    }

    /// Set the burst size
    #[must_use]
    pub fn with_burst_size(mut self, size: u32) -> Self {
        self.burst_size = size;
        self
    }

    /// Enable or disable limiting
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the minimum throttle delay
    #[must_use]
    pub fn with_min_throttle_delay_ms(mut self, delay: u64) -> Self {
        self.min_throttle_delay_ms = delay;
        self
    }

    /// Set the maximum throttle delay
    #[must_use]
    pub fn with_max_throttle_delay_ms(mut self, delay: u64) -> Self {
        self.max_throttle_delay_ms = delay;
        self
    }

    /// No limiting (tests, trusted local consumers)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// =============================================================================
// Check result
// =============================================================================

/// Result of a rate limit check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// A token was consumed
    Allowed,

    /// No token available; retry after `delay`
    Throttled {
        /// Recommended wait
        delay: Duration,
    },
}

impl RateLimitResult {
    /// Whether a token was consumed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The wait, if throttled
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Throttled { delay } => Some(*delay),
            Self::Allowed => None,
        }
    }
}

/// Limiter counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    /// Envelopes that passed the limiter
    pub total: u64,
    /// Envelopes that had to wait
    pub throttled: u64,
    /// Tokens currently available
    pub available_tokens: u32,
}

// =============================================================================
// Token bucket
// =============================================================================

struct Bucket {
    /// Tokens scaled by 1000
    tokens_millis: u64,
    last_refill: Instant,
}

/// Token bucket for one stream
pub struct EnvelopeRateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    total: AtomicU64,
    throttled: AtomicU64,
    throttling: AtomicBool,
}

impl std::fmt::Debug for EnvelopeRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeRateLimiter")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EnvelopeRateLimiter {
    /// Create a limiter with a full bucket
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let burst_tokens_millis = u64::from(config.burst_size.max(1)) * 1000;
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens_millis: burst_tokens_millis,
                last_refill: Instant::now(),
            }),
            total: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            throttling: AtomicBool::new(false),
        }
    }

    /// Try to take a token without waiting
    pub fn check(&self) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed;
        }

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens_millis >= 1000 {
            bucket.tokens_millis -= 1000;
            return RateLimitResult::Allowed;
        }

        // Rate r tokens/s refills r millitokens per millisecond
        let tokens_needed = 1000 - bucket.tokens_millis;
        let rate = u64::from(self.config.envelopes_per_second);
        let delay_ms = if rate > 0 {
            tokens_needed.div_ceil(rate)
        } else {
            self.config.max_throttle_delay_ms
        };
        let delay_ms = delay_ms
            .max(self.config.min_throttle_delay_ms)
            .min(self.config.max_throttle_delay_ms);

        RateLimitResult::Throttled {
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed_ms = u64::try_from(now.duration_since(bucket.last_refill).as_millis())
            .unwrap_or(u64::MAX);
        if elapsed_ms == 0 {
            return;
        }
        let max_tokens_millis = u64::from(self.config.burst_size.max(1)) * 1000;
        let added = u64::from(self.config.envelopes_per_second).saturating_mul(elapsed_ms);
        bucket.tokens_millis = bucket.tokens_millis.saturating_add(added).min(max_tokens_millis);
        bucket.last_refill = now;
    }

    /// Wait for a token
    ///
    /// Returns the time spent waiting, if any.
    pub async fn acquire(&self) -> Option<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            match self.check() {
                RateLimitResult::Allowed => break,
                RateLimitResult::Throttled { delay } => {
                    if waited.is_zero() && !self.throttling.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            target: "chronicle::rate_limit",
                            envelopes_per_second = self.config.envelopes_per_second,
                            burst_size = self.config.burst_size,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Stream throttled by rate limit"
                        );
                    }
                    tokio::time::sleep(delay).await;
                    waited += delay;
                }
            }
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        if waited.is_zero() {
            self.throttling.store(false, Ordering::Relaxed);
            None
        } else {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            Some(waited)
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> RateLimitStats {
        let tokens = self.bucket.lock().tokens_millis / 1000;
        RateLimitStats {
            total: self.total.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            available_tokens: u32::try_from(tokens).unwrap_or(u32::MAX),
        }
    }
}
