//! Token-bucket admission control for outbound VK requests.
//!
//! One [`RateLimiter`] is shared (behind an `Arc`) by every fetch in the
//! process. It wraps a `governor` direct limiter whose quota is
//! `requests_per_second` with a burst of `burst` cells; `governor` keeps the
//! bucket as a single atomic timestamp, so refill is computed lazily on each
//! check and no background timer is needed.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::Quota;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use tokio_util::sync::CancellationToken;

/// Steady-state requests per second VK allows a user token.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 3;

/// Burst capacity.
pub const DEFAULT_BURST: u32 = 10;

/// Returned when the caller's cancellation token fires while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Cancelled while waiting for a rate-limit token")]
pub struct Cancelled;

type DirectLimiter<C> =
    governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// A shared token bucket.
pub struct RateLimiter<C: Clock = DefaultClock> {
    quota: Quota,
    clock: C,
    limiter: DirectLimiter<C>,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND, DEFAULT_BURST)
    }
}

/// `requests_per_second` with a burst of `burst`. Zero values are raised
/// to one.
#[must_use]
pub fn quota(requests_per_second: u32, burst: u32) -> Quota {
    let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(rate).allow_burst(burst)
}

impl RateLimiter {
    /// Creates a full bucket holding `burst` tokens that refills at
    /// `requests_per_second`. Zero values are raised to one.
    #[must_use]
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self::with_quota(quota(requests_per_second, burst))
    }

    /// Creates a full bucket for an arbitrary `governor` quota.
    #[must_use]
    pub fn with_quota(quota: Quota) -> Self {
        Self::with_clock(quota, DefaultClock::default())
    }

    /// Waits until a token is available, then takes it.
    ///
    /// Admission is not FIFO: every waiter re-checks the bucket when its
    /// computed refill delay expires, and the first to check wins.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if `cancel` fires before a token is taken. No
    /// token is consumed in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        match self.try_acquire() {
            Ok(()) => return Ok(()),
            Err(wait) => log::trace!("rate limiter: waiting {wait:?} for a token"),
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Cancelled),
            () = self.limiter.until_ready() => Ok(()),
        }
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Creates a full bucket driven by `clock`.
    #[must_use]
    pub fn with_clock(quota: Quota, clock: C) -> Self
    where
        C: Clone,
    {
        let limiter = governor::RateLimiter::direct_with_clock(quota, clock.clone());
        Self {
            quota,
            clock,
            limiter,
        }
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// the next one refills.
    ///
    /// # Errors
    ///
    /// Returns the wait duration when the bucket is empty.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// The quota this limiter enforces.
    #[must_use]
    pub const fn quota(&self) -> Quota {
        self.quota
    }
}
