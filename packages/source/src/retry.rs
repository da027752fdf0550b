//! Bounded retry with exponential backoff for single VK requests.
//!
//! Every VK call goes through [`RetryExecutor::execute`] rather than
//! calling a [`crate::VkApi`] method directly. The executor takes a
//! rate-limit token before each attempt (retries included) and retries
//! rate-limit and transient failures with exponential backoff.
//!
//! # Usage
//!
//! ```ignore
//! let page = executor
//!     .execute(&cancel, "group 100", || api.get_posts(-100, 0, 100))
//!     .await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::FetchError;
use crate::rate_limit::RateLimiter;

/// Default number of attempts per request.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Backoff unit. With doubling per attempt this gives 2s, 4s, 8s, 16s.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single backoff sleep.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(32);

/// How many times to try a request and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Backoff unit, doubled for each failed attempt.
    pub backoff_base: Duration,
    /// Cap applied to each backoff sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Sleep after the given failed attempt (1-based):
    /// `min(backoff_base * 2^attempt, max_backoff)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Wraps single VK requests with rate limiting and bounded retry.
///
/// Stateless apart from the shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor drawing tokens from `limiter`.
    #[must_use]
    pub const fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self { limiter, policy }
    }

    /// The retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `request` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// `request` is called once per attempt and must perform exactly one
    /// HTTP call. A request that is already in flight is never abandoned;
    /// `cancel` is observed while waiting for a token and while backing off.
    ///
    /// # Errors
    ///
    /// * [`FetchError::Cancelled`] if `cancel` fires while waiting.
    /// * [`FetchError::MaxRetriesExceeded`] if every attempt failed with a
    ///   retryable error.
    /// * Any non-retryable error from `request`, unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut request: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire(cancel).await?;

            let error = match request().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                log::error!("[{label}] {error}, giving up after {attempt} attempts");
                return Err(FetchError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.backoff(attempt);
            log::warn!(
                "[{label}] {error} (attempt {attempt}/{max_attempts}), retrying in {delay:?}"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicU32, Ordering};

    use governor::Quota;
    use tokio::time::Instant;

    use super::*;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(Arc::new(RateLimiter::new(100, 100)), RetryPolicy::default())
    }

    /// Fails with `error` for the first `failures` calls, then succeeds.
    async fn flaky(calls: &AtomicU32, failures: u32, error: FetchError) -> Result<u32, FetchError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures { Err(error) } else { Ok(n) }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(40), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_fewer_rate_limits_than_max() {
        let calls = AtomicU32::new(0);
        let k = 3;

        let result = executor()
            .execute(&CancellationToken::new(), "test", || {
                flaky(&calls, k, FetchError::RateLimited)
            })
            .await;

        assert_eq!(result.unwrap(), k + 1);
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let max = DEFAULT_MAX_RETRIES;

        let result = executor()
            .execute(&CancellationToken::new(), "test", || {
                flaky(&calls, max + 1, FetchError::RateLimited)
            })
            .await;

        match result {
            Err(FetchError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, max);
                assert!(matches!(*last, FetchError::RateLimited));
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), max);
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_between_attempts() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        executor()
            .execute(&CancellationToken::new(), "test", || {
                flaky(
                    &calls,
                    2,
                    FetchError::Transient {
                        message: "connection reset".into(),
                    },
                )
            })
            .await
            .unwrap();

        // 2s after the first failure, 4s after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_fails_immediately() {
        let calls = AtomicU32::new(0);

        let result = executor()
            .execute(&CancellationToken::new(), "test", || {
                flaky(
                    &calls,
                    10,
                    FetchError::Http {
                        status: 404,
                        body: "not found".into(),
                    },
                )
            })
            .await;

        assert!(matches!(result, Err(FetchError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            })
        };

        let start = Instant::now();
        let result = executor()
            .execute(&cancel, "test", || flaky(&calls, 10, FetchError::RateLimited))
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_takes_a_token() {
        let per_minute = NonZeroU32::new(1).unwrap();
        let burst = NonZeroU32::new(5).unwrap();
        let limiter = Arc::new(RateLimiter::with_quota(
            Quota::per_minute(per_minute).allow_burst(burst),
        ));
        let policy = RetryPolicy {
            backoff_base: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let executor = RetryExecutor::new(limiter.clone(), policy);
        let calls = AtomicU32::new(0);

        executor
            .execute(&CancellationToken::new(), "test", || {
                flaky(&calls, 2, FetchError::RateLimited)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.try_acquire(), Ok(()));
        assert_eq!(limiter.try_acquire(), Ok(()));
        assert!(limiter.try_acquire().is_err());
    }
}
