//! Per-peer HTTP rate limiting (GCRA via `governor`).
//!
//! Applies to every inbound HTTP request, including WebSocket upgrades.
//! Frames on an established WebSocket are not limited here.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

/// Keyed token bucket, one bucket per client IP.
pub struct HttpRateLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    per_minute: u32,
}

impl HttpRateLimiter {
    /// Allow `per_minute` requests per IP, with a burst of the same size.
    /// Zero is raised to one.
    pub fn per_minute(per_minute: u32) -> Self {
        let rate = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(rate)),
            per_minute: rate.get(),
        }
    }

    /// Consume one cell for `ip`.  Returns `false` when the request must be
    /// refused with `429`.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    pub fn limit_per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Forget buckets that have fully refilled.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}

impl std::fmt::Debug for HttpRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}
