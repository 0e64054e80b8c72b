//! Entry executor - turns a trade signal into a ledger position
//!
//! Limits are pre-checked without touching the exchange, so a rejected signal
//! never produces an order. The ledger performs the authoritative check when
//! the position is inserted; if it refuses after a live fill, the fill is
//! unwound with a reduce-only close.

use crate::domain::entities::events::PositionEvent;
use crate::domain::entities::position::{
    now_millis, NewPosition, PartialLevel, Position, PositionStatus, ProtectiveOrders,
    MAX_PARTIAL_LEVELS,
};
use crate::domain::entities::signal::TradeSignal;
use crate::domain::errors::{LedgerError, ValidationError};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError};
use crate::domain::repositories::notifier::Notifier;
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::value_objects::symbol_rules::SymbolRules;
use crate::retry::RetryExecutor;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("Invalid signal: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Quantity {qty} for {symbol} is below the tradable minimum {min_qty}")]
    BelowMinimum {
        symbol: String,
        qty: Decimal,
        min_qty: Decimal,
    },
}

impl EntryError {
    pub fn is_limit(&self) -> bool {
        matches!(self, EntryError::Ledger(e) if e.is_limit())
    }
}

/// A configured partial level, positioned relative to entry and take-profit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialLevelTemplate {
    /// Fraction of the entry-to-TP distance, in (0, 1]
    pub target_fraction: Decimal,
    /// Fraction of the original size to exit, in (0, 1]
    pub exit_fraction: Decimal,
    pub move_stop_to_break_even: bool,
}

impl PartialLevelTemplate {
    pub fn resolve(&self, entry: Decimal, take_profit: Decimal) -> PartialLevel {
        PartialLevel::new(
            entry + (take_profit - entry) * self.target_fraction,
            self.exit_fraction,
            self.move_stop_to_break_even,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConfig {
    /// Fill locally at the signal price and mark positions SIMULATED
    pub paper_trading: bool,
    pub protective_orders: bool,
    pub default_leverage: u32,
    /// Trailing distance as a percentage of entry; `None` disables trailing
    pub trailing_distance_percent: Option<Decimal>,
    pub partial_levels: Vec<PartialLevelTemplate>,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            paper_trading: true,
            protective_orders: true,
            default_leverage: 2,
            trailing_distance_percent: Some(Decimal::new(15, 1)),
            partial_levels: vec![PartialLevelTemplate {
                target_fraction: Decimal::new(5, 1),
                exit_fraction: Decimal::new(5, 1),
                move_stop_to_break_even: true,
            }],
        }
    }
}

pub struct EntryExecutor {
    ledger: Arc<PositionLedger>,
    exchange: Arc<dyn ExchangeClient>,
    executor: RetryExecutor,
    notifier: Arc<dyn Notifier>,
    config: EntryConfig,
}

impl EntryExecutor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        exchange: Arc<dyn ExchangeClient>,
        executor: RetryExecutor,
        notifier: Arc<dyn Notifier>,
        config: EntryConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            executor,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    pub async fn open_from_signal(&self, signal: TradeSignal) -> Result<Position, EntryError> {
        signal.validate()?;
        self.ledger.check_limits(&signal.symbol).await?;

        let rules = self.symbol_rules(&signal.symbol).await?;
        let qty = rules.round_qty(signal.size);
        if !rules.is_tradable(qty) {
            return Err(EntryError::BelowMinimum {
                symbol: signal.symbol.clone(),
                qty,
                min_qty: rules.min_qty,
            });
        }
        let leverage = signal.leverage.unwrap_or(self.config.default_leverage);
        let stop_loss = rules.round_price(signal.stop_loss);
        let take_profit = rules.round_price(signal.take_profit);

        let (entry_price, size, status, entry_order_id) = if self.config.paper_trading {
            (signal.entry_price, qty, PositionStatus::Simulated, None)
        } else {
            let fill = self
                .executor
                .call("open", || {
                    self.exchange.open(&signal.symbol, signal.side, qty, leverage)
                })
                .await?;
            info!(
                "Filled {} {} {} @ {} (order {})",
                signal.side, fill.qty, signal.symbol, fill.price, fill.order_id
            );
            (fill.price, fill.qty, PositionStatus::Active, Some(fill.order_id))
        };

        let protective_orders = if status == PositionStatus::Active && self.config.protective_orders {
            self.place_protective(&signal.symbol, stop_loss, take_profit, size)
                .await
        } else {
            ProtectiveOrders::default()
        };

        let new = NewPosition {
            symbol: signal.symbol.clone(),
            side: signal.side,
            status,
            entry_price,
            size,
            qty_step: rules.step_size,
            leverage,
            stop_loss,
            take_profit: Some(take_profit),
            trailing_distance: self.trailing_distance(&signal, entry_price),
            partial_levels: self.partial_levels(&signal, entry_price, take_profit),
            protective_orders,
            entry_order_id,
            opened_at: now_millis(),
        };

        let id = match self.ledger.open(new.clone()).await {
            Ok(id) => id,
            Err(e) => {
                if status == PositionStatus::Active {
                    self.unwind(&new, &e).await;
                }
                return Err(e.into());
            }
        };

        let position = Position::from_new(id, new);
        self.notifier.notify(PositionEvent::opened(&position)).await;
        Ok(position)
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, EntryError> {
        let operation = format!("symbol_rules({})", symbol);
        match self
            .executor
            .call(&operation, || self.exchange.symbol_rules(symbol))
            .await
        {
            Ok(rules) => Ok(rules),
            Err(e) if self.config.paper_trading => {
                warn!("No symbol rules for {} ({}), using defaults", symbol, e);
                Ok(SymbolRules::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn place_protective(
        &self,
        symbol: &str,
        stop_loss: Decimal,
        take_profit: Decimal,
        qty: Decimal,
    ) -> ProtectiveOrders {
        match self
            .executor
            .call("place_protective", || {
                self.exchange
                    .place_protective(symbol, stop_loss, Some(take_profit), qty)
            })
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                warn!(
                    "Could not place protective orders for {}: {}; stop is enforced locally only",
                    symbol, e
                );
                ProtectiveOrders::default()
            }
        }
    }

    fn trailing_distance(&self, signal: &TradeSignal, entry_price: Decimal) -> Option<Decimal> {
        signal.trailing_distance.or_else(|| {
            self.config
                .trailing_distance_percent
                .map(|percent| entry_price * percent / Decimal::ONE_HUNDRED)
        })
    }

    fn partial_levels(
        &self,
        signal: &TradeSignal,
        entry_price: Decimal,
        take_profit: Decimal,
    ) -> [Option<PartialLevel>; MAX_PARTIAL_LEVELS] {
        let levels: Vec<PartialLevel> = match &signal.partial_levels {
            Some(levels) => levels.clone(),
            None => self
                .config
                .partial_levels
                .iter()
                .map(|template| template.resolve(entry_price, take_profit))
                .collect(),
        };
        let mut slots: [Option<PartialLevel>; MAX_PARTIAL_LEVELS] = Default::default();
        for (slot, level) in slots.iter_mut().zip(levels) {
            *slot = Some(level);
        }
        slots
    }

    /// Undo a live fill the ledger refused to record
    async fn unwind(&self, new: &NewPosition, cause: &LedgerError) {
        warn!(
            "Ledger rejected filled {} {} ({}), unwinding",
            new.side, new.symbol, cause
        );

        for order_id in new.protective_orders.order_ids() {
            if let Err(e) = self.exchange.cancel(&new.symbol, order_id).await {
                debug!("Cancel of {} during unwind failed: {}", order_id, e);
            }
        }

        let result = self
            .executor
            .call("close", || self.exchange.close(&new.symbol, new.size))
            .await;
        if let Err(e) = result {
            error!(
                "CRITICAL: {} {} {} is open on the exchange but not in the ledger: {}",
                new.side, new.size, new.symbol, e
            );
            self.notifier
                .notify(PositionEvent::Inconsistency {
                    position_id: 0,
                    symbol: new.symbol.clone(),
                    detail: format!(
                        "untracked exchange position of {} after ledger rejection ({}); unwind failed: {}",
                        new.size, cause, e
                    ),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::PositionSide;
    use crate::domain::services::position_ledger::PositionLimits;
    use crate::infrastructure::notifier::ChannelNotifier;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::repository::SqliteLedgerStore;
    use crate::persistence::{init_database, DatabaseConfig};
    use crate::retry::RetryPolicy;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        exchange: Arc<PaperExchange>,
        ledger: Arc<PositionLedger>,
        entries: EntryExecutor,
        events: mpsc::Receiver<PositionEvent>,
    }

    async fn harness(config: EntryConfig, limits: PositionLimits) -> Harness {
        let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
        let ledger = Arc::new(
            PositionLedger::restore(Arc::new(SqliteLedgerStore::new(pool)), limits)
                .await
                .unwrap(),
        );
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_mark("BTCUSDT", dec!(100));
        exchange.set_mark("ETHUSDT", dec!(50));
        let (notifier, events) = ChannelNotifier::new(16);
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(1),
        });
        let entries = EntryExecutor::new(
            ledger.clone(),
            exchange.clone(),
            executor,
            Arc::new(notifier),
            config,
        );
        Harness {
            exchange,
            ledger,
            entries,
            events,
        }
    }

    fn live() -> EntryConfig {
        EntryConfig {
            paper_trading: false,
            ..EntryConfig::default()
        }
    }

    fn signal(symbol: &str) -> TradeSignal {
        TradeSignal::new(symbol, PositionSide::Long, dec!(100), dec!(90), dec!(120), dec!(2))
    }

    #[test]
    fn test_template_resolves_symmetrically() {
        let template = PartialLevelTemplate {
            target_fraction: dec!(0.5),
            exit_fraction: dec!(0.5),
            move_stop_to_break_even: true,
        };
        assert_eq!(template.resolve(dec!(100), dec!(120)).target_price, dec!(110));
        assert_eq!(template.resolve(dec!(100), dec!(80)).target_price, dec!(90));
    }

    #[tokio::test]
    async fn test_paper_entry_is_simulated_at_signal_price() {
        let mut h = harness(EntryConfig::default(), PositionLimits::default()).await;

        let position = h.entries.open_from_signal(signal("BTCUSDT")).await.unwrap();
        assert_eq!(position.status, PositionStatus::Simulated);
        assert_eq!(position.entry_price, dec!(100));
        assert_eq!(position.trailing_distance, Some(dec!(1.5)));
        assert_eq!(
            position.partial_levels[0].as_ref().map(|l| l.target_price),
            Some(dec!(110))
        );
        assert!(position.partial_levels[1].is_none());
        assert!(h.exchange.position_amount("BTCUSDT").is_zero());
        assert!(matches!(h.events.recv().await, Some(PositionEvent::Opened { .. })));
    }

    #[tokio::test]
    async fn test_live_entry_fills_and_places_protection() {
        let h = harness(live(), PositionLimits::default()).await;
        h.exchange.set_mark("BTCUSDT", dec!(101));

        let position = h.entries.open_from_signal(signal("BTCUSDT")).await.unwrap();
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(position.entry_price, dec!(101));
        assert!(position.entry_order_id.is_some());
        assert!(position.protective_orders.sl_order_id.is_some());
        assert_eq!(h.exchange.position_amount("BTCUSDT"), dec!(2));
        assert_eq!(h.exchange.resting_orders("BTCUSDT"), 2);
    }

    #[tokio::test]
    async fn test_limit_rejection_never_reaches_exchange() {
        let h = harness(
            live(),
            PositionLimits {
                max_total: 1,
                max_per_symbol: 1,
            },
        )
        .await;
        h.entries.open_from_signal(signal("BTCUSDT")).await.unwrap();

        let err = h.entries.open_from_signal(signal("ETHUSDT")).await.unwrap_err();
        assert!(err.is_limit());
        assert!(h.exchange.position_amount("ETHUSDT").is_zero());
    }

    #[tokio::test]
    async fn test_ledger_rejection_unwinds_fill() {
        let h = harness(live(), PositionLimits::default()).await;
        // Price gapped below the stop between signal and fill
        h.exchange.set_mark("BTCUSDT", dec!(89));

        let err = h.entries.open_from_signal(signal("BTCUSDT")).await.unwrap_err();
        assert!(matches!(err, EntryError::Ledger(LedgerError::Validation(_))));
        assert!(h.exchange.position_amount("BTCUSDT").is_zero());
        assert_eq!(h.exchange.resting_orders("BTCUSDT"), 0);
        assert_eq!(h.ledger.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_below_minimum_quantity_is_rejected() {
        let h = harness(EntryConfig::default(), PositionLimits::default()).await;
        h.exchange
            .set_rules("BTCUSDT", SymbolRules::new(dec!(0.1), dec!(0.01), dec!(0.5)));
        let mut small = signal("BTCUSDT");
        small.size = dec!(0.45);

        assert!(matches!(
            h.entries.open_from_signal(small).await,
            Err(EntryError::BelowMinimum { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_signal_is_rejected() {
        let h = harness(EntryConfig::default(), PositionLimits::default()).await;
        let mut bad = signal("BTCUSDT");
        bad.stop_loss = dec!(105);
        assert!(matches!(
            h.entries.open_from_signal(bad).await,
            Err(EntryError::Validation(ValidationError::StopOnWrongSide { .. }))
        ));
    }
}
