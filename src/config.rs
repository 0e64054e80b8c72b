use crate::domain::services::entry_executor::{EntryConfig, PartialLevelTemplate};
use crate::domain::services::portfolio_reconciliation::ReconciliationConfig;
use crate::domain::services::position_ledger::PositionLimits;
use crate::domain::services::price_oracle::PriceOracleConfig;
use crate::persistence::DatabaseConfig;
use crate::rate_limit::RateLimiterConfig;
use crate::retry::RetryPolicy;
use rust_decimal::Decimal;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// A partial take-profit level as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialLevelConfig {
    /// Where the level sits between entry (0) and take-profit (1)
    pub target_fraction: Decimal,
    /// Percent of the original size to exit, in (0, 100]
    pub percent: Decimal,
    pub move_stop_to_break_even: bool,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_open_positions: usize,
    pub max_positions_per_symbol: usize,

    pub monitor_interval_seconds: u64,
    /// Every Nth monitor cycle also reconciles; cycle 0 always does
    pub reconciliation_every_n_cycles: u64,
    pub ghost_grace_period_seconds: u64,

    pub price_max_age_milliseconds: u64,
    pub price_cache_capacity: usize,

    pub exchange_request_timeout_milliseconds: u64,
    pub exchange_max_attempts: u32,
    pub exchange_retry_delay_milliseconds: u64,
    pub exchange_requests_per_minute: u32,

    pub trailing_stop_enabled: bool,
    pub trailing_stop_distance_percent: Decimal,

    pub partial_tp_enabled: bool,
    pub partial_levels: Vec<PartialLevelConfig>,

    pub paper_trading: bool,
    pub protective_orders_enabled: bool,
    pub default_leverage: u32,

    pub database: DatabaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_open_positions: 15,
            max_positions_per_symbol: 1,

            monitor_interval_seconds: 3,
            reconciliation_every_n_cycles: 10,
            ghost_grace_period_seconds: 60,

            price_max_age_milliseconds: 5000,
            price_cache_capacity: 512,

            exchange_request_timeout_milliseconds: 5000,
            exchange_max_attempts: 3,
            exchange_retry_delay_milliseconds: 250,
            exchange_requests_per_minute: 1200,

            trailing_stop_enabled: true,
            trailing_stop_distance_percent: Decimal::new(15, 1), // 1.5%

            partial_tp_enabled: true,
            partial_levels: vec![PartialLevelConfig {
                target_fraction: Decimal::new(5, 1),
                percent: Decimal::from(50),
                move_stop_to_break_even: true,
            }],

            paper_trading: true,
            protective_orders_enabled: true,
            default_leverage: 2,

            database: DatabaseConfig::default(),
        }
    }
}

/// Parse `name` into `T`, keeping `current` when unset, unparsable or rejected by `valid`.
fn env_value<T>(name: &str, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {}, using default: {}",
                name,
                value,
                current
            );
            current
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                current
            );
            current
        }
    }
}

fn env_flag(name: &str, current: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                tracing::warn!(
                    "Invalid {} value: {}, using default: {}",
                    name,
                    other,
                    current
                );
                current
            }
        },
        Err(_) => current,
    }
}

/// Like `env_value` for settings that may be absent altogether
fn optional_env(
    name: &str,
    current: Option<Decimal>,
    valid: impl Fn(&Decimal) -> bool,
) -> Option<Decimal> {
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.trim().parse::<Decimal>() {
        Ok(value) if valid(&value) => Some(value),
        _ => {
            tracing::warn!("Invalid {} value: '{}', using default: {:?}", name, raw, current);
            current
        }
    }
}

fn is_unit_fraction(value: &Decimal) -> bool {
    *value > Decimal::ZERO && *value <= Decimal::ONE
}

fn is_percent(value: &Decimal) -> bool {
    *value > Decimal::ZERO && *value <= Decimal::ONE_HUNDRED
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        config.max_open_positions =
            env_value("MAX_OPEN_POSITIONS", config.max_open_positions, |v| *v > 0);
        config.max_positions_per_symbol = env_value(
            "MAX_POSITIONS_PER_SYMBOL",
            config.max_positions_per_symbol,
            |v| *v > 0,
        );

        config.monitor_interval_seconds = env_value(
            "MONITOR_INTERVAL_SECONDS",
            config.monitor_interval_seconds,
            |v| *v > 0,
        );
        config.reconciliation_every_n_cycles = env_value(
            "RECONCILIATION_EVERY_N_CYCLES",
            config.reconciliation_every_n_cycles,
            |v| *v > 0,
        );
        config.ghost_grace_period_seconds = env_value(
            "GHOST_GRACE_PERIOD_SECONDS",
            config.ghost_grace_period_seconds,
            |_| true,
        );

        config.price_max_age_milliseconds = env_value(
            "PRICE_MAX_AGE_MILLISECONDS",
            config.price_max_age_milliseconds,
            |v| *v > 0,
        );
        config.price_cache_capacity =
            env_value("PRICE_CACHE_CAPACITY", config.price_cache_capacity, |v| *v > 0);

        config.exchange_request_timeout_milliseconds = env_value(
            "EXCHANGE_REQUEST_TIMEOUT_MILLISECONDS",
            config.exchange_request_timeout_milliseconds,
            |v| *v > 0,
        );
        config.exchange_max_attempts = env_value(
            "EXCHANGE_MAX_ATTEMPTS",
            config.exchange_max_attempts,
            |v| (1..=10).contains(v),
        );
        config.exchange_retry_delay_milliseconds = env_value(
            "EXCHANGE_RETRY_DELAY_MILLISECONDS",
            config.exchange_retry_delay_milliseconds,
            |_| true,
        );
        config.exchange_requests_per_minute = env_value(
            "EXCHANGE_REQUESTS_PER_MINUTE",
            config.exchange_requests_per_minute,
            |v| *v > 0,
        );

        config.trailing_stop_enabled = env_flag("TRAILING_STOP_ENABLED", config.trailing_stop_enabled);
        config.trailing_stop_distance_percent = env_value(
            "TRAILING_STOP_DISTANCE_PERCENT",
            config.trailing_stop_distance_percent,
            |v| *v > Decimal::ZERO && *v < Decimal::ONE_HUNDRED,
        );

        config.partial_tp_enabled = env_flag("PARTIAL_TP_ENABLED", config.partial_tp_enabled);
        config.partial_levels = Self::partial_levels_from_env(&config.partial_levels);

        config.paper_trading = env_flag("PAPER_TRADING", config.paper_trading);
        config.protective_orders_enabled =
            env_flag("PROTECTIVE_ORDERS_ENABLED", config.protective_orders_enabled);
        config.default_leverage =
            env_value("DEFAULT_LEVERAGE", config.default_leverage, |v| (1..=125).contains(v));

        config.database = DatabaseConfig::from_env();

        config
    }

    fn partial_levels_from_env(defaults: &[PartialLevelConfig]) -> Vec<PartialLevelConfig> {
        let mut levels: Vec<PartialLevelConfig> = Vec::new();

        if let Some(level) = Self::level_from_env(1, defaults.first().copied(), true) {
            levels.push(level);
        }

        if let Some(level) = Self::level_from_env(2, defaults.get(1).copied(), false) {
            match levels.first() {
                Some(first) if level.target_fraction <= first.target_fraction => {
                    tracing::warn!(
                        "PARTIAL_TP_2_TARGET_FRACTION {} must lie beyond level 1 ({}), ignoring level 2",
                        level.target_fraction,
                        first.target_fraction
                    );
                }
                Some(first) if first.percent + level.percent > Decimal::ONE_HUNDRED => {
                    tracing::warn!(
                        "Partial exit percents sum to {} (> 100), ignoring level 2",
                        first.percent + level.percent
                    );
                }
                Some(_) => levels.push(level),
                None => tracing::warn!("PARTIAL_TP_2 configured without level 1, ignoring"),
            }
        }

        levels
    }

    /// A level exists only when both its target and its percent are known
    fn level_from_env(
        index: usize,
        defaults: Option<PartialLevelConfig>,
        default_break_even: bool,
    ) -> Option<PartialLevelConfig> {
        let target = optional_env(
            &format!("PARTIAL_TP_{}_TARGET_FRACTION", index),
            defaults.map(|l| l.target_fraction),
            is_unit_fraction,
        );
        let percent = optional_env(
            &format!("PARTIAL_TP_{}_PERCENT", index),
            defaults.map(|l| l.percent),
            is_percent,
        );
        let break_even = env_flag(
            &format!("PARTIAL_TP_{}_BREAK_EVEN", index),
            defaults
                .map(|l| l.move_stop_to_break_even)
                .unwrap_or(default_break_even),
        );

        Some(PartialLevelConfig {
            target_fraction: target?,
            percent: percent?,
            move_stop_to_break_even: break_even,
        })
    }

    pub fn position_limits(&self) -> PositionLimits {
        PositionLimits {
            max_total: self.max_open_positions,
            max_per_symbol: self.max_positions_per_symbol,
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.exchange_max_attempts,
            initial_delay: Duration::from_millis(self.exchange_retry_delay_milliseconds),
            max_delay: RetryPolicy::default().max_delay,
            call_timeout: Duration::from_millis(self.exchange_request_timeout_milliseconds),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.exchange_requests_per_minute,
        }
    }

    pub fn price_oracle_config(&self) -> PriceOracleConfig {
        PriceOracleConfig {
            max_age: Duration::from_millis(self.price_max_age_milliseconds),
            capacity: self.price_cache_capacity,
        }
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            grace_period: Duration::from_secs(self.ghost_grace_period_seconds),
        }
    }

    pub fn entry_config(&self) -> EntryConfig {
        let partial_levels = if self.partial_tp_enabled {
            self.partial_levels
                .iter()
                .map(|level| PartialLevelTemplate {
                    target_fraction: level.target_fraction,
                    exit_fraction: level.percent / Decimal::ONE_HUNDRED,
                    move_stop_to_break_even: level.move_stop_to_break_even,
                })
                .collect()
        } else {
            Vec::new()
        };

        EntryConfig {
            paper_trading: self.paper_trading,
            protective_orders: self.protective_orders_enabled,
            default_leverage: self.default_leverage,
            trailing_distance_percent: self
                .trailing_stop_enabled
                .then_some(self.trailing_stop_distance_percent),
            partial_levels,
        }
    }
}
