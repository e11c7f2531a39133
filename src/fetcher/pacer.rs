use std::num::NonZeroU32;
use std::time::Duration;

use governor::{clock::DefaultClock, middleware::NoOpMiddleware, state::NotKeyed, Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, governor::state::InMemoryState, DefaultClock, NoOpMiddleware>;

/// One permit per `interval`, no burst. Idle time does not bank permits.
/// A zero interval is clamped to one microsecond.
pub fn pacer_quota(interval: Duration) -> Quota {
    Quota::with_period(interval.max(Duration::from_micros(1))).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Shared outbound pacer. Concurrent callers queue on the same limiter and
/// leave one interval apart.
pub struct Pacer {
    interval: Duration,
    limiter: DirectLimiter,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            limiter: RateLimiter::direct(pacer_quota(interval)),
        }
    }

    /// Wait for the next permit.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
