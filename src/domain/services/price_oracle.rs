use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::retry::RetryExecutor;
use lru::LruCache;
use rust_decimal::Decimal;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PriceOracleConfig {
    /// A cached price older than this is ignored
    pub max_age: Duration,
    /// Number of symbols kept in the cache
    pub capacity: usize,
}

impl Default for PriceOracleConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(5),
            capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    updated_at: Instant,
}

/// Best-effort current price per symbol.
///
/// Push updates (e.g. a ticker stream) land in an LRU cache via `update`.
/// `price` serves a fresh cached value, otherwise pulls the ticker from the
/// exchange under the retry policy. `None` means "no price this cycle", never zero.
pub struct PriceOracle {
    cache: Mutex<LruCache<String, CachedPrice>>,
    exchange: Arc<dyn ExchangeClient>,
    executor: RetryExecutor,
    max_age: Duration,
}

impl PriceOracle {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        executor: RetryExecutor,
        config: PriceOracleConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            exchange,
            executor,
            max_age: config.max_age,
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, CachedPrice>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push a price observed by a stream. Non-positive prices are dropped.
    pub fn update(&self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            debug!("Ignoring non-positive price {} for {}", price, symbol);
            return;
        }
        self.cache().put(
            symbol.to_string(),
            CachedPrice {
                price,
                updated_at: Instant::now(),
            },
        );
    }

    /// Cached price if it is still fresh
    pub fn cached(&self, symbol: &str) -> Option<Decimal> {
        let mut cache = self.cache();
        let entry = cache.get(symbol)?;
        (entry.updated_at.elapsed() <= self.max_age).then_some(entry.price)
    }

    /// Latest known price regardless of age
    pub fn last_known(&self, symbol: &str) -> Option<Decimal> {
        self.cache().peek(symbol).map(|entry| entry.price)
    }

    pub async fn price(&self, symbol: &str) -> Option<Decimal> {
        if let Some(price) = self.cached(symbol) {
            return Some(price);
        }

        let operation = format!("ticker_price({})", symbol);
        match self
            .executor
            .call(&operation, || self.exchange.ticker_price(symbol))
            .await
        {
            Ok(price) if price > Decimal::ZERO => {
                self.update(symbol, price);
                Some(price)
            }
            Ok(price) => {
                warn!("Exchange returned non-positive price {} for {}", price, symbol);
                None
            }
            Err(e) => {
                warn!("No price for {} this cycle: {}", symbol, e);
                None
            }
        }
    }
}
