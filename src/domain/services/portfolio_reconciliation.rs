//! Portfolio reconciliation against the exchange
//!
//! The exchange's list of open positions is the ground truth. A ledger
//! position (ACTIVE only, paper trades are skipped) that the exchange no
//! longer reports is a ghost: it was closed remotely, typically by an
//! exchange-side stop. Ghosts younger than the grace period are left alone to
//! absorb read-after-write lag; older ones are closed through the ledger with
//! `EXTERNAL_CLOSE` at the best price that can be recovered.
//!
//! The reverse drift is exchange exposure the ledger does not account for:
//! an exchange close that failed after the ledger recorded it, a partial
//! reduce that never went through, or a position opened outside the engine.
//! Excess seen on two consecutive passes is flattened with a reduce-only
//! close, so a fill whose ledger insert is still in flight is not touched.

use crate::domain::entities::closed_trade::CloseReason;
use crate::domain::entities::events::PositionEvent;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangePosition,
};
use crate::domain::repositories::notifier::Notifier;
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::price_oracle::PriceOracle;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Where a ghost's close price came from, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseSource {
    TradeHistory,
    MarketPrice,
    /// Nothing better known; PnL is zero and flagged degraded
    EntryPrice,
}

impl fmt::Display for CloseSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloseSource::TradeHistory => write!(f, "trade history"),
            CloseSource::MarketPrice => write!(f, "market price"),
            CloseSource::EntryPrice => write!(f, "entry price"),
        }
    }
}

/// One ghost closed by a reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostResolution {
    pub position_id: i64,
    pub symbol: String,
    pub close_price: Decimal,
    pub source: CloseSource,
    pub pnl_amount: Decimal,
}

/// Exchange exposure with no ledger counterpart, closed by a reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanFlatten {
    pub symbol: String,
    pub qty: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    /// Ledger and exchange agree
    Ok,
    /// Ghosts closed with recovered prices or orphan exposure flattened
    Resolved,
    /// At least one ghost closed at entry price
    Degraded,
    /// At least one ghost or orphan could not be closed
    Failed,
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconciliationStatus::Ok => write!(f, "OK"),
            ReconciliationStatus::Resolved => write!(f, "RESOLVED"),
            ReconciliationStatus::Degraded => write!(f, "DEGRADED"),
            ReconciliationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
    pub exchange_positions: usize,
    /// ACTIVE ledger positions compared against the exchange
    pub checked: usize,
    pub ghosts_closed: Vec<GhostResolution>,
    /// Ghost candidates still inside the grace period
    pub ghosts_in_grace: Vec<i64>,
    /// Symbols open on the exchange with no ledger position
    pub untracked_symbols: Vec<String>,
    /// Excess exchange exposure seen for the first time, flattened next pass
    #[serde(default)]
    pub orphans_pending: Vec<String>,
    #[serde(default)]
    pub orphans_flattened: Vec<OrphanFlatten>,
    pub failures: Vec<String>,
    pub status: ReconciliationStatus,
}

impl ReconciliationReport {
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            timestamp: Utc::now(),
            exchange_positions: 0,
            checked: 0,
            ghosts_closed: Vec::new(),
            ghosts_in_grace: Vec::new(),
            untracked_symbols: Vec::new(),
            orphans_pending: Vec::new(),
            orphans_flattened: Vec::new(),
            failures: Vec::new(),
            status: ReconciliationStatus::Ok,
        }
    }

    fn escalate(&mut self, status: ReconciliationStatus) {
        self.status = self.status.max(status);
    }

    pub fn add_resolution(&mut self, resolution: GhostResolution) {
        let status = if resolution.source == CloseSource::EntryPrice {
            ReconciliationStatus::Degraded
        } else {
            ReconciliationStatus::Resolved
        };
        self.escalate(status);
        self.ghosts_closed.push(resolution);
    }

    pub fn add_flattened(&mut self, flatten: OrphanFlatten) {
        self.escalate(ReconciliationStatus::Resolved);
        self.orphans_flattened.push(flatten);
    }

    pub fn add_failure(&mut self, failure: String) {
        self.escalate(ReconciliationStatus::Failed);
        self.failures.push(failure);
    }

    pub fn degraded_closes(&self) -> usize {
        self.ghosts_closed
            .iter()
            .filter(|g| g.source == CloseSource::EntryPrice)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("Exchange error during reconciliation: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Ledger error during reconciliation: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Audit error: {0}")]
    Audit(String),
}

/// Persists reconciliation reports
#[async_trait]
pub trait ReconciliationAudit: Send + Sync {
    async fn save_report(&self, report: &ReconciliationReport) -> Result<(), ReconciliationError>;
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Ghost candidates younger than this are left alone
    pub grace_period: Duration,
}

/// Exchange quantity per symbol beyond what the given ledger positions hold.
///
/// Exposure in the opposite direction of the ledger counts in full.
pub fn excess_exposure(remote: &[ExchangePosition], tracked: &[Position]) -> Vec<(String, Decimal)> {
    let mut held: HashMap<&str, Decimal> = HashMap::new();
    for position in tracked {
        let signed = match position.side {
            PositionSide::Long => position.remaining_size,
            PositionSide::Short => -position.remaining_size,
        };
        *held.entry(position.symbol.as_str()).or_default() += signed;
    }

    let mut excess: Vec<(String, Decimal)> = remote
        .iter()
        .filter(|p| p.is_open())
        .filter_map(|p| {
            let ledger = held.get(p.symbol.as_str()).copied().unwrap_or_default();
            let same_direction =
                !ledger.is_zero() && ledger.is_sign_negative() == p.amount.is_sign_negative();
            let qty = if same_direction {
                p.amount.abs() - ledger.abs()
            } else {
                p.amount.abs()
            };
            (qty > Decimal::ZERO).then(|| (p.symbol.clone(), qty))
        })
        .collect();
    excess.sort();
    excess
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Compares the ledger with the exchange and closes ghosts
pub struct ReconciliationService {
    ledger: Arc<PositionLedger>,
    exchange: Arc<dyn ExchangeClient>,
    oracle: Arc<PriceOracle>,
    executor: RetryExecutor,
    notifier: Arc<dyn Notifier>,
    audit: Option<Arc<dyn ReconciliationAudit>>,
    config: ReconciliationConfig,
    /// Excess per symbol seen by the previous pass
    suspected_orphans: Mutex<HashMap<String, Decimal>>,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<PositionLedger>,
        exchange: Arc<dyn ExchangeClient>,
        oracle: Arc<PriceOracle>,
        executor: RetryExecutor,
        notifier: Arc<dyn Notifier>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            oracle,
            executor,
            notifier,
            audit: None,
            config,
            suspected_orphans: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn ReconciliationAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run one reconciliation pass.
    ///
    /// Fails only when the exchange's position list cannot be fetched; per-ghost
    /// problems are recorded in the report and the pass carries on.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ReconciliationError> {
        let mut report = ReconciliationReport::new(self.exchange.name());

        let remote = self
            .executor
            .call("open_positions", || self.exchange.open_positions())
            .await?;
        let live: HashSet<&str> = remote
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.symbol.as_str())
            .collect();
        report.exchange_positions = live.len();

        let tracked: Vec<Position> = self
            .ledger
            .list_open()
            .await
            .into_iter()
            .filter(|p| !p.is_simulated())
            .collect();
        report.checked = tracked.len();

        let tracked_symbols: HashSet<&str> = tracked.iter().map(|p| p.symbol.as_str()).collect();
        let mut untracked: Vec<String> = live
            .difference(&tracked_symbols)
            .map(|s| s.to_string())
            .collect();
        untracked.sort();
        if !untracked.is_empty() {
            warn!(
                "Exchange reports positions with no ledger entry: {}",
                untracked.join(", ")
            );
        }
        report.untracked_symbols = untracked;

        let excess = excess_exposure(&remote, &tracked);

        let now = Utc::now();
        let grace = chrono::Duration::milliseconds(
            i64::try_from(self.config.grace_period.as_millis()).unwrap_or(i64::MAX),
        );

        for position in tracked.iter().filter(|p| !live.contains(p.symbol.as_str())) {
            let age = position.age(now);
            if age < grace {
                debug!(
                    "{} #{} missing on exchange but only {}s old, within grace period",
                    position.symbol,
                    position.id,
                    age.num_seconds()
                );
                report.ghosts_in_grace.push(position.id);
                continue;
            }

            warn!(
                "Ghost position {} #{} ({}s old): closed on exchange, reconciling",
                position.symbol,
                position.id,
                age.num_seconds()
            );
            match self.close_ghost(position).await {
                Ok(Some(resolution)) => report.add_resolution(resolution),
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to reconcile {} #{}: {}", position.symbol, position.id, e);
                    report.add_failure(format!("{} #{}: {}", position.symbol, position.id, e));
                }
            }
        }

        self.resolve_orphans(excess, &mut report).await;

        info!(
            "Reconciliation {}: {} exchange positions, {} checked, {} ghosts closed, {} in grace, {} orphans flattened",
            report.status,
            report.exchange_positions,
            report.checked,
            report.ghosts_closed.len(),
            report.ghosts_in_grace.len(),
            report.orphans_flattened.len()
        );

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.save_report(&report).await {
                warn!("Failed to persist reconciliation report: {}", e);
            }
        }

        Ok(report)
    }

    async fn resolve_orphans(&self, excess: Vec<(String, Decimal)>, report: &mut ReconciliationReport) {
        let mut suspected = self.suspected_orphans.lock().await;
        let previous = std::mem::take(&mut *suspected);

        for (symbol, qty) in excess {
            let Some(seen) = previous.get(&symbol) else {
                warn!(
                    "Exchange holds {} {} more than the ledger, flattening if still there next pass",
                    qty, symbol
                );
                report.orphans_pending.push(symbol.clone());
                suspected.insert(symbol, qty);
                continue;
            };

            let qty = qty.min(*seen);
            let operation = format!("close({})", symbol);
            match self
                .executor
                .call(&operation, || self.exchange.close(&symbol, qty))
                .await
            {
                Ok(fill) => {
                    warn!(
                        "Flattened orphan exposure: {} {} @ {} (order {})",
                        fill.qty, symbol, fill.price, fill.order_id
                    );
                    report.add_flattened(OrphanFlatten {
                        symbol,
                        qty: fill.qty,
                        price: fill.price,
                    });
                }
                Err(e) => {
                    error!(
                        "CRITICAL: exchange holds {} {} with no ledger position and the close failed: {}",
                        qty, symbol, e
                    );
                    report.add_failure(format!("orphan {} {}: {}", qty, symbol, e));
                    self.notifier
                        .notify(PositionEvent::Inconsistency {
                            position_id: 0,
                            symbol: symbol.clone(),
                            detail: format!(
                                "exchange exposure of {} not in ledger, close failed: {}",
                                qty, e
                            ),
                        })
                        .await;
                    suspected.insert(symbol, qty);
                }
            }
        }
    }

    async fn close_ghost(
        &self,
        position: &Position,
    ) -> Result<Option<GhostResolution>, ReconciliationError> {
        let (price, source) = self.resolve_close_price(position).await;

        let result = match source {
            CloseSource::EntryPrice => {
                self.ledger
                    .close_degraded(position.id, price, CloseReason::ExternalClose)
                    .await
            }
            _ => {
                self.ledger
                    .close(position.id, price, CloseReason::ExternalClose)
                    .await
            }
        };

        let trade = match result {
            Ok(trade) => trade,
            Err(LedgerError::PositionNotFound(id)) => {
                debug!("Ghost #{} was closed concurrently, nothing to do", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // The sibling of the order that closed the position is still resting
        for order_id in position.protective_orders.order_ids() {
            if let Err(e) = self.exchange.cancel(&position.symbol, order_id).await {
                debug!(
                    "Cancel of protective order {} on {} failed: {}",
                    order_id, position.symbol, e
                );
            }
        }

        if source == CloseSource::EntryPrice {
            warn!(
                "{} #{} closed at entry price {}: no fill or market price available",
                position.symbol, position.id, price
            );
        }

        let resolution = GhostResolution {
            position_id: position.id,
            symbol: position.symbol.clone(),
            close_price: price,
            source,
            pnl_amount: trade.pnl.amount,
        };
        self.notifier.notify(PositionEvent::Closed { trade }).await;
        Ok(Some(resolution))
    }

    /// Recover the close price: the exchange fill, then the market, then entry.
    pub async fn resolve_close_price(&self, position: &Position) -> (Decimal, CloseSource) {
        let operation = format!("account_trades({})", position.symbol);
        match self
            .executor
            .call(&operation, || {
                self.exchange
                    .account_trades(&position.symbol, position.opened_at)
            })
            .await
        {
            Ok(trades) => {
                let closing_fill = trades
                    .iter()
                    .filter(|t| t.time >= position.opened_at && !t.realized_pnl.is_zero())
                    .max_by_key(|t| t.time);
                if let Some(fill) = closing_fill {
                    debug!(
                        "Recovered close fill for {} #{}: {} @ {} (order {})",
                        position.symbol, position.id, fill.qty, fill.price, fill.order_id
                    );
                    return (fill.price, CloseSource::TradeHistory);
                }
            }
            Err(e) => {
                warn!("Trade history unavailable for {}: {}", position.symbol, e);
            }
        }

        if let Some(price) = self.oracle.price(&position.symbol).await {
            return (price, CloseSource::MarketPrice);
        }

        (position.entry_price, CloseSource::EntryPrice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{
        now_millis, NewPosition, PositionSide, PositionStatus, ProtectiveOrders,
    };
    use crate::domain::services::position_ledger::PositionLimits;
    use crate::domain::services::price_oracle::PriceOracleConfig;
    use crate::infrastructure::notifier::ChannelNotifier;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::repository::SqliteLedgerStore;
    use crate::persistence::{init_database, DatabaseConfig};
    use crate::retry::RetryPolicy;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Harness {
        exchange: Arc<PaperExchange>,
        ledger: Arc<PositionLedger>,
        service: ReconciliationService,
        events: mpsc::Receiver<PositionEvent>,
    }

    fn fast_executor() -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        })
    }

    async fn harness() -> Harness {
        let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
        let ledger = Arc::new(
            PositionLedger::restore(
                Arc::new(SqliteLedgerStore::new(pool)),
                PositionLimits::default(),
            )
            .await
            .unwrap(),
        );
        let exchange = Arc::new(PaperExchange::new());
        let oracle = Arc::new(PriceOracle::new(
            exchange.clone(),
            fast_executor(),
            PriceOracleConfig::default(),
        ));
        let (notifier, events) = ChannelNotifier::new(16);
        let service = ReconciliationService::new(
            ledger.clone(),
            exchange.clone(),
            oracle,
            fast_executor(),
            Arc::new(notifier),
            ReconciliationConfig {
                grace_period: Duration::from_secs(60),
            },
        );
        Harness {
            exchange,
            ledger,
            service,
            events,
        }
    }

    fn position(symbol: &str, status: PositionStatus, age_secs: i64) -> NewPosition {
        NewPosition {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            status,
            entry_price: dec!(100),
            size: dec!(1),
            qty_step: dec!(0.001),
            leverage: 2,
            stop_loss: dec!(90),
            take_profit: Some(dec!(150)),
            trailing_distance: None,
            partial_levels: [None, None],
            protective_orders: ProtectiveOrders::default(),
            entry_order_id: None,
            opened_at: now_millis() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_ghost_closes_at_exchange_fill_price() {
        let mut h = harness().await;
        h.exchange.set_mark("BTCUSDT", dec!(100));
        h.exchange
            .open("BTCUSDT", PositionSide::Long, dec!(1), 2)
            .await
            .unwrap();
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 200))
            .await
            .unwrap();

        h.exchange
            .close_externally("BTCUSDT", dec!(95), Utc::now())
            .unwrap();
        h.exchange.set_mark("BTCUSDT", dec!(97));

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.ghosts_closed.len(), 1);
        assert_eq!(report.ghosts_closed[0].source, CloseSource::TradeHistory);
        assert_eq!(report.ghosts_closed[0].close_price, dec!(95));
        assert_eq!(report.status, ReconciliationStatus::Resolved);

        assert!(h.ledger.get(id).await.is_none());
        let trades = h.ledger.closed_trades_for(id).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, CloseReason::ExternalClose);
        assert_eq!(trades[0].pnl.amount, dec!(-5));

        match h.events.recv().await {
            Some(PositionEvent::Closed { trade }) => assert_eq!(trade.position_id, id),
            other => panic!("expected Closed event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_young_ghost_is_left_in_grace() {
        let h = harness().await;
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 5))
            .await
            .unwrap();

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.ghosts_in_grace, vec![id]);
        assert!(report.ghosts_closed.is_empty());
        assert!(h.ledger.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_ghost_without_history_uses_market_price() {
        let h = harness().await;
        h.exchange.set_mark("BTCUSDT", dec!(103));
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 200))
            .await
            .unwrap();

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.ghosts_closed[0].source, CloseSource::MarketPrice);
        let trades = h.ledger.closed_trades_for(id).await.unwrap();
        assert_eq!(trades[0].close_price, dec!(103));
        assert!(!trades[0].degraded);
    }

    #[tokio::test]
    async fn test_ghost_without_any_price_closes_degraded_at_entry() {
        let h = harness().await;
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 200))
            .await
            .unwrap();

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.status, ReconciliationStatus::Degraded);
        assert_eq!(report.degraded_closes(), 1);

        let trades = h.ledger.closed_trades_for(id).await.unwrap();
        assert_eq!(trades[0].close_price, dec!(100));
        assert!(trades[0].pnl.amount.is_zero());
        assert!(trades[0].degraded);
    }

    #[tokio::test]
    async fn test_exchange_failure_leaves_ledger_untouched() {
        let h = harness().await;
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 200))
            .await
            .unwrap();
        h.exchange.fail_operation(
            "open_positions",
            ExchangeError::Network("connection reset".into()),
            1,
        );

        assert!(matches!(
            h.service.reconcile().await,
            Err(ReconciliationError::Exchange(ExchangeError::Network(_)))
        ));
        assert!(h.ledger.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_simulated_positions_are_skipped_and_untracked_reported() {
        let h = harness().await;
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Simulated, 200))
            .await
            .unwrap();
        h.exchange.seed_position("ETHUSDT", dec!(-2), dec!(50));

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(report.exchange_positions, 1);
        assert_eq!(report.untracked_symbols, vec!["ETHUSDT".to_string()]);
        assert_eq!(report.orphans_pending, vec!["ETHUSDT".to_string()]);
        assert_eq!(report.status, ReconciliationStatus::Ok);
        assert!(h.ledger.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_ghost_close_cancels_resting_sibling() {
        let h = harness().await;
        h.exchange.set_mark("BTCUSDT", dec!(100));
        h.exchange
            .open("BTCUSDT", PositionSide::Long, dec!(1), 2)
            .await
            .unwrap();
        let orders = h
            .exchange
            .place_protective("BTCUSDT", dec!(90), Some(dec!(150)), dec!(1))
            .await
            .unwrap();
        let id = h
            .ledger
            .open(NewPosition {
                protective_orders: orders,
                ..position("BTCUSDT", PositionStatus::Active, 200)
            })
            .await
            .unwrap();

        h.exchange
            .close_externally("BTCUSDT", dec!(90), Utc::now())
            .unwrap();
        assert_eq!(h.exchange.resting_orders("BTCUSDT"), 2);

        let report = h.service.reconcile().await.unwrap();
        assert_eq!(report.ghosts_closed[0].position_id, id);
        assert_eq!(h.exchange.resting_orders("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_excess_exposure_flattened_on_second_pass() {
        let h = harness().await;
        h.exchange.set_mark("BTCUSDT", dec!(104));
        // A partial reduce never reached the exchange
        h.exchange.seed_position("BTCUSDT", dec!(2), dec!(100));
        let id = h
            .ledger
            .open(position("BTCUSDT", PositionStatus::Active, 200))
            .await
            .unwrap();

        let first = h.service.reconcile().await.unwrap();
        assert_eq!(first.orphans_pending, vec!["BTCUSDT".to_string()]);
        assert!(first.orphans_flattened.is_empty());
        assert_eq!(first.status, ReconciliationStatus::Ok);
        assert_eq!(h.exchange.position_amount("BTCUSDT"), dec!(2));

        let second = h.service.reconcile().await.unwrap();
        assert_eq!(
            second.orphans_flattened,
            vec![OrphanFlatten {
                symbol: "BTCUSDT".into(),
                qty: dec!(1),
                price: dec!(104),
            }]
        );
        assert_eq!(second.status, ReconciliationStatus::Resolved);
        assert_eq!(h.exchange.position_amount("BTCUSDT"), dec!(1));
        assert!(h.ledger.get(id).await.is_some());

        let third = h.service.reconcile().await.unwrap();
        assert!(third.orphans_pending.is_empty());
        assert_eq!(third.status, ReconciliationStatus::Ok);
    }

    #[tokio::test]
    async fn test_failed_orphan_close_is_retried() {
        let mut h = harness().await;
        h.exchange.set_mark("ETHUSDT", dec!(50));
        h.exchange.seed_position("ETHUSDT", dec!(-3), dec!(55));

        h.service.reconcile().await.unwrap();
        h.exchange.fail_operation(
            "close",
            ExchangeError::OrderRejected("reduce-only rejected".into()),
            1,
        );
        let failed = h.service.reconcile().await.unwrap();
        assert_eq!(failed.status, ReconciliationStatus::Failed);
        assert_eq!(failed.failures.len(), 1);
        assert!(matches!(
            h.events.recv().await,
            Some(PositionEvent::Inconsistency { position_id: 0, ref symbol, .. }) if symbol == "ETHUSDT"
        ));

        let retried = h.service.reconcile().await.unwrap();
        assert_eq!(retried.orphans_flattened.len(), 1);
        assert!(h.exchange.position_amount("ETHUSDT").is_zero());
    }

    #[test]
    fn test_excess_exposure_by_direction() {
        let long = Position::from_new(1, position("BTCUSDT", PositionStatus::Active, 0));
        let remote = |symbol: &str, amount: Decimal| ExchangePosition {
            symbol: symbol.into(),
            amount,
            entry_price: dec!(100),
            mark_price: None,
        };

        assert!(excess_exposure(&[remote("BTCUSDT", dec!(1))], &[long.clone()]).is_empty());
        assert_eq!(
            excess_exposure(&[remote("BTCUSDT", dec!(1.5))], &[long.clone()]),
            vec![("BTCUSDT".to_string(), dec!(0.5))]
        );
        // Opposite side of the ledger: all of it is unaccounted for
        assert_eq!(
            excess_exposure(&[remote("BTCUSDT", dec!(-1))], &[long.clone()]),
            vec![("BTCUSDT".to_string(), dec!(1))]
        );
        assert_eq!(
            excess_exposure(
                &[remote("SOLUSDT", dec!(-4)), remote("ETHUSDT", dec!(0))],
                &[long]
            ),
            vec![("SOLUSDT".to_string(), dec!(4))]
        );
    }

    #[test]
    fn test_status_escalates_to_worst() {
        let mut report = ReconciliationReport::new("paper");
        assert_eq!(report.status, ReconciliationStatus::Ok);

        report.add_resolution(GhostResolution {
            position_id: 1,
            symbol: "BTCUSDT".into(),
            close_price: Decimal::ONE_HUNDRED,
            source: CloseSource::EntryPrice,
            pnl_amount: Decimal::ZERO,
        });
        assert_eq!(report.status, ReconciliationStatus::Degraded);

        report.add_resolution(GhostResolution {
            position_id: 2,
            symbol: "ETHUSDT".into(),
            close_price: Decimal::ONE_HUNDRED,
            source: CloseSource::TradeHistory,
            pnl_amount: Decimal::ONE,
        });
        assert_eq!(report.status, ReconciliationStatus::Degraded);
        assert_eq!(report.degraded_closes(), 1);

        report.add_failure("boom".into());
        assert_eq!(report.status, ReconciliationStatus::Failed);
    }
}
