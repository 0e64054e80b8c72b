//! Position Monitor Actor
//!
//! Drives the position lifecycle on a fixed interval. Each cycle:
//! 1. reconciles with the exchange (cycle 0 and every Nth cycle after),
//! 2. snapshots the open set and fetches prices outside the ledger lock,
//! 3. evaluates partial exits, then SL/TP, then the trailing stop,
//! 4. applies the resulting mutations as one ledger batch,
//! 5. mirrors closes and partial exits on the exchange and notifies.
//!
//! The ledger is the accounting source of truth: an exchange call that fails
//! after the ledger committed is reported as an inconsistency and left for
//! the next reconciliation pass.

use crate::domain::entities::closed_trade::{CloseReason, ClosedTrade};
use crate::domain::entities::events::PositionEvent;
use crate::domain::entities::position::{Position, PositionStatus, ProtectiveOrders};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::repositories::notifier::Notifier;
use crate::domain::services::partial_exit;
use crate::domain::services::pnl_calculator::unrealized;
use crate::domain::services::portfolio_reconciliation::{
    ReconciliationReport, ReconciliationService,
};
use crate::domain::services::position_ledger::{LedgerMutation, MutationOutcome, PositionLedger};
use crate::domain::services::price_oracle::PriceOracle;
use crate::domain::services::trailing_stop::{self, TrailingState};
use crate::domain::value_objects::pnl::PERCENT_SCALE;
use crate::retry::RetryExecutor;
use futures_util::future::join_all;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Channel capacity for monitor actor messages
const MONITOR_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Reconcile on cycle 0 and then every `reconcile_every` cycles
    pub reconcile_every: u64,
    /// Upper bound for a whole reconciliation pass
    pub reconciliation_timeout: Duration,
    /// Re-place exchange SL/TP orders after the stop or size changes
    pub refresh_protective_orders: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            reconcile_every: 10,
            reconciliation_timeout: Duration::from_secs(30),
            refresh_protective_orders: true,
        }
    }
}

/// Mark-to-market view of the open set for one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioSnapshot {
    pub open_positions: usize,
    /// Positions that had a price this cycle
    pub priced_positions: usize,
    pub total_margin: Decimal,
    pub unrealized_pnl: Decimal,
    /// Unrealized PnL against total margin
    pub unrealized_pnl_percent: Decimal,
}

impl PortfolioSnapshot {
    pub fn compute(positions: &[Position], prices: &HashMap<String, Option<Decimal>>) -> Self {
        let mut snapshot = PortfolioSnapshot {
            open_positions: positions.len(),
            ..Default::default()
        };
        for position in positions {
            snapshot.total_margin += position.margin;
            if let Some(Some(price)) = prices.get(&position.symbol) {
                snapshot.priced_positions += 1;
                snapshot.unrealized_pnl += unrealized(
                    position.entry_price,
                    *price,
                    position.side,
                    position.remaining_size,
                )
                .amount;
            }
        }
        if !snapshot.total_margin.is_zero() {
            snapshot.unrealized_pnl_percent = (snapshot.unrealized_pnl / snapshot.total_margin
                * Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(PERCENT_SCALE, RoundingStrategy::MidpointAwayFromZero);
        }
        snapshot
    }
}

/// What one monitor cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub reconciliation: Option<ReconciliationReport>,
    pub evaluated: usize,
    /// Positions skipped because no price was available
    pub deferred: usize,
    pub trailed: usize,
    pub partial_exits: usize,
    pub closed: Vec<ClosedTrade>,
    /// Mutations the ledger refused plus failed exchange calls
    pub errors: usize,
    pub portfolio: PortfolioSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub cycles: u64,
    pub reconciliations: u64,
    pub failed_reconciliations: u64,
    pub positions_closed: u64,
    pub errors: u64,
}

/// Messages that can be sent to the monitor actor
#[derive(Debug)]
pub enum MonitorMessage {
    /// Run a cycle now, outside the interval
    RunCycle { reply: oneshot::Sender<CycleReport> },
    GetStats { reply: oneshot::Sender<MonitorStats> },
}

/// Decide what a single price observation does to a position.
///
/// Priority is partial exit, then stop-loss, then take-profit, then trailing.
/// A partial exit in this cycle defers trailing to the next one.
pub fn evaluate_position(position: &Position, price: Decimal) -> Option<LedgerMutation> {
    if let Some(level) = partial_exit::triggered_level(position, price) {
        match partial_exit::plan(position, level) {
            Ok(_) => {
                return Some(LedgerMutation::PartialExit {
                    id: position.id,
                    level,
                    price,
                })
            }
            Err(reason) => debug!(
                "{} #{} partial level {} not executable: {}",
                position.symbol,
                position.id,
                level + 1,
                reason
            ),
        }
    }

    if position.stop_hit(price) {
        return Some(LedgerMutation::Close {
            id: position.id,
            price,
            reason: CloseReason::StopLoss,
        });
    }
    if position.take_profit_hit(price) {
        return Some(LedgerMutation::Close {
            id: position.id,
            price,
            reason: CloseReason::TakeProfit,
        });
    }

    let state = TrailingState::from_position(position)?;
    trailing_stop::evaluate(&state, price).map(|update| LedgerMutation::Trail {
        id: position.id,
        update,
    })
}

/// Position Monitor
pub struct PositionMonitor {
    ledger: Arc<PositionLedger>,
    exchange: Arc<dyn ExchangeClient>,
    oracle: Arc<PriceOracle>,
    executor: RetryExecutor,
    notifier: Arc<dyn Notifier>,
    reconciler: Option<Arc<ReconciliationService>>,
    config: MonitorConfig,
    cycle: u64,
    stats: MonitorStats,
}

impl PositionMonitor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        exchange: Arc<dyn ExchangeClient>,
        oracle: Arc<PriceOracle>,
        executor: RetryExecutor,
        notifier: Arc<dyn Notifier>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            oracle,
            executor,
            notifier,
            reconciler: None,
            config,
            cycle: 0,
            stats: MonitorStats::default(),
        }
    }

    pub fn with_reconciliation(mut self, reconciler: Arc<ReconciliationService>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Spawn the monitor loop. It stops at the next cycle boundary once
    /// `shutdown` fires or its sender is dropped.
    pub fn spawn(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> (mpsc::Sender<MonitorMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MONITOR_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            self.run(rx, shutdown).await;
        });
        info!("PositionMonitor spawned");
        (tx, handle)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<MonitorMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            "PositionMonitor started (interval {:?}, reconcile every {} cycles)",
            self.config.interval, self.config.reconcile_every
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbox_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("PositionMonitor received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                msg = rx.recv(), if inbox_open => match msg {
                    Some(MonitorMessage::RunCycle { reply }) => {
                        let report = self.run_cycle().await;
                        if reply.send(report).is_err() {
                            debug!("RunCycle requester went away");
                        }
                    }
                    Some(MonitorMessage::GetStats { reply }) => {
                        let _ = reply.send(self.stats.clone());
                    }
                    None => inbox_open = false,
                },
            }
        }

        info!(
            "PositionMonitor stopped after {} cycles ({} positions closed)",
            self.stats.cycles, self.stats.positions_closed
        );
    }

    /// Run one monitor cycle. Never fails: per-position errors are counted and logged.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.cycle;
        self.cycle += 1;
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        if cycle % self.config.reconcile_every.max(1) == 0 {
            report.reconciliation = self.reconcile().await;
        }

        let snapshot = self.ledger.list_open().await;
        if snapshot.is_empty() {
            self.finish(&report);
            return report;
        }

        let prices = self.fetch_prices(&snapshot).await;
        report.portfolio = PortfolioSnapshot::compute(&snapshot, &prices);

        let mut mutations = Vec::new();
        for position in &snapshot {
            match prices.get(&position.symbol).copied().flatten() {
                Some(price) => {
                    report.evaluated += 1;
                    if let Some(mutation) = evaluate_position(position, price) {
                        mutations.push(mutation);
                    }
                }
                None => {
                    debug!(
                        "No price for {}, deferring #{} to next cycle",
                        position.symbol, position.id
                    );
                    report.deferred += 1;
                }
            }
        }

        if !mutations.is_empty() {
            let before: HashMap<i64, &Position> = snapshot.iter().map(|p| (p.id, p)).collect();
            for (mutation, result) in self.ledger.apply_batch(mutations).await {
                let previous = before.get(&mutation.position_id()).copied();
                match result {
                    Ok(outcome) => self.settle(outcome, previous, &mut report).await,
                    Err(LedgerError::PositionNotFound(id)) => {
                        debug!("#{} left the ledger before its mutation applied", id);
                    }
                    Err(e) => {
                        error!("Ledger rejected {:?}: {}", mutation, e);
                        report.errors += 1;
                    }
                }
            }
        }

        info!(
            "Cycle {}: {} open, {} priced, unrealized {} ({}% of margin {})",
            cycle,
            report.portfolio.open_positions,
            report.portfolio.priced_positions,
            report.portfolio.unrealized_pnl.round_dp(2),
            report.portfolio.unrealized_pnl_percent,
            report.portfolio.total_margin.round_dp(2)
        );
        self.finish(&report);
        report
    }

    fn finish(&mut self, report: &CycleReport) {
        self.stats.cycles += 1;
        self.stats.positions_closed += report.closed.len() as u64;
        self.stats.errors += report.errors as u64;
    }

    async fn reconcile(&mut self) -> Option<ReconciliationReport> {
        let reconciler = self.reconciler.clone()?;
        self.stats.reconciliations += 1;
        match timeout(self.config.reconciliation_timeout, reconciler.reconcile()).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!("Reconciliation failed, retrying next scheduled cycle: {}", e);
                self.stats.failed_reconciliations += 1;
                None
            }
            Err(_) => {
                warn!(
                    "Reconciliation timed out after {:?}",
                    self.config.reconciliation_timeout
                );
                self.stats.failed_reconciliations += 1;
                None
            }
        }
    }

    async fn fetch_prices(&self, positions: &[Position]) -> HashMap<String, Option<Decimal>> {
        let mut symbols: Vec<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();

        let prices = join_all(symbols.iter().map(|symbol| self.oracle.price(symbol))).await;
        symbols
            .into_iter()
            .map(str::to_string)
            .zip(prices)
            .collect()
    }

    /// Exchange side effects and notifications for one committed mutation
    async fn settle(
        &self,
        outcome: MutationOutcome,
        previous: Option<&Position>,
        report: &mut CycleReport,
    ) {
        match outcome {
            MutationOutcome::Trailed(position) => {
                report.trailed += 1;
                let stop_moved = previous.map_or(true, |p| p.stop_loss != position.stop_loss);
                if !stop_moved {
                    return;
                }
                info!(
                    "{} #{} trailing stop -> {} (water-mark {})",
                    position.symbol, position.id, position.stop_loss, position.watermark
                );
                if !position.is_simulated() {
                    self.refresh_protective(&position).await;
                }
                self.notifier
                    .notify(PositionEvent::StopMoved {
                        position_id: position.id,
                        symbol: position.symbol.clone(),
                        stop_loss: position.stop_loss,
                        watermark: position.watermark,
                    })
                    .await;
            }
            MutationOutcome::Reduced { trade, position } => {
                report.partial_exits += 1;
                if !position.is_simulated() {
                    if !self.close_on_exchange(&trade, report).await {
                        return;
                    }
                    self.refresh_protective(&position).await;
                }
                self.notifier
                    .notify(PositionEvent::PartialExit {
                        remaining_size: position.remaining_size,
                        trade,
                    })
                    .await;
            }
            MutationOutcome::Closed(trade) => {
                if trade.status != PositionStatus::Simulated {
                    if let Some(position) = previous {
                        self.cancel_protective(&position.symbol, &position.protective_orders)
                            .await;
                    }
                    self.close_on_exchange(&trade, report).await;
                }
                report.closed.push(trade.clone());
                let event = if trade.reason.is_partial() {
                    PositionEvent::PartialExit {
                        trade,
                        remaining_size: Decimal::ZERO,
                    }
                } else {
                    PositionEvent::Closed { trade }
                };
                self.notifier.notify(event).await;
            }
        }
    }

    /// Mirror a ledger close on the exchange. Returns false on failure.
    async fn close_on_exchange(&self, trade: &ClosedTrade, report: &mut CycleReport) -> bool {
        let operation = format!("close({})", trade.symbol);
        match self
            .executor
            .call(&operation, || self.exchange.close(&trade.symbol, trade.quantity))
            .await
        {
            Ok(fill) => {
                info!(
                    "{} #{} {}: closed {} on exchange @ {} (order {})",
                    trade.symbol, trade.position_id, trade.reason, fill.qty, fill.price, fill.order_id
                );
                true
            }
            Err(e) => {
                error!(
                    "CRITICAL: ledger recorded {} of {} {} #{} but the exchange close failed: {}",
                    trade.reason, trade.quantity, trade.symbol, trade.position_id, e
                );
                report.errors += 1;
                self.notifier
                    .notify(PositionEvent::Inconsistency {
                        position_id: trade.position_id,
                        symbol: trade.symbol.clone(),
                        detail: format!(
                            "{} of {} recorded in ledger, exchange close failed: {}",
                            trade.reason, trade.quantity, e
                        ),
                    })
                    .await;
                false
            }
        }
    }

    async fn cancel_protective(&self, symbol: &str, orders: &ProtectiveOrders) {
        for order_id in orders.order_ids() {
            if let Err(e) = self.exchange.cancel(symbol, order_id).await {
                debug!("Cancel of protective order {} on {} failed: {}", order_id, symbol, e);
            }
        }
    }

    /// Replace exchange SL/TP orders so they match the ledger's stop and size
    async fn refresh_protective(&self, position: &Position) {
        if !self.config.refresh_protective_orders {
            return;
        }
        self.cancel_protective(&position.symbol, &position.protective_orders)
            .await;

        let operation = format!("place_protective({})", position.symbol);
        let placed = self
            .executor
            .call(&operation, || {
                self.exchange.place_protective(
                    &position.symbol,
                    position.stop_loss,
                    position.take_profit,
                    position.remaining_size,
                )
            })
            .await;
        let orders = match placed {
            Ok(orders) => orders,
            Err(e) => {
                warn!(
                    "Could not refresh protective orders for {} #{}: {}",
                    position.symbol, position.id, e
                );
                ProtectiveOrders::default()
            }
        };
        if let Err(e) = self.ledger.set_protective_orders(position.id, orders).await {
            debug!("Protective orders for #{} not recorded: {}", position.id, e);
        }
    }
}
