use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Outbound request budget towards the exchange
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests per minute
    pub requests_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 1200,
        }
    }
}

/// Process-wide limiter shared by every exchange call
pub type ExchangeRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a new rate limiter. A zero budget is clamped to one request per minute.
pub fn create_rate_limiter(config: &RateLimiterConfig) -> ExchangeRateLimiter {
    let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

/// Wait until the limiter admits one more request.
pub async fn acquire(limiter: &ExchangeRateLimiter) {
    if limiter.check().is_err() {
        tracing::debug!("Exchange request budget exhausted, waiting for capacity");
        limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_burst_up_to_quota() {
        let limiter = create_rate_limiter(&RateLimiterConfig {
            requests_per_minute: 2,
        });
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_budget_is_clamped() {
        let limiter = create_rate_limiter(&RateLimiterConfig {
            requests_per_minute: 0,
        });
        assert!(limiter.check().is_ok());
    }

    #[tokio::test]
    async fn test_acquire_passes_with_capacity() {
        let limiter = create_rate_limiter(&RateLimiterConfig::default());
        acquire(&limiter).await;
        acquire(&limiter).await;
    }
}
