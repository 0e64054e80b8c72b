//! Bounded retry for exchange calls
//!
//! Every call gets its own timeout. Transient failures (timeout, rate limit,
//! network) are retried with capped exponential backoff plus jitter; permanent
//! failures return immediately. The loop is iterative and gives up after
//! `max_attempts`.

use crate::domain::repositories::exchange_client::{ExchangeError, ExchangeResult};
use crate::rate_limit::{self, ExchangeRateLimiter};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Retry policy for external calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let spread = (base.as_millis() / 4) as u64;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}

/// Runs exchange calls under a retry policy and the shared request budget
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    limiter: Option<ExchangeRateLimiter>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: ExchangeRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if let Some(limiter) = &self.limiter {
                rate_limit::acquire(limiter).await;
            }

            let result = match timeout(self.policy.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, self.policy.call_timeout
                ))),
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.policy.jittered_delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} giving up after {} attempts: {}", operation, attempts, e);
                    } else {
                        warn!("{} failed permanently: {}", operation, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = RetryExecutor::new(fast_policy());

        let counter = calls.clone();
        let result = executor
            .call("ticker", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExchangeError::RateLimited("429".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = RetryExecutor::new(fast_policy());

        let counter = calls.clone();
        let result: ExchangeResult<()> = executor
            .call("open", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::InvalidSymbol("NOPE".into()))
                }
            })
            .await;

        assert_eq!(result, Err(ExchangeError::InvalidSymbol("NOPE".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = RetryExecutor::new(fast_policy());

        let counter = calls.clone();
        let result: ExchangeResult<()> = executor
            .call("positions", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Network("reset".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(ExchangeError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        });
        let result: ExchangeResult<()> = executor
            .call("history", || async {
                sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
    }
}
