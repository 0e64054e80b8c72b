//! PositionLedger service - the authoritative open set and closed-trade history
//!
//! A single async mutex serializes every mutation together with the limit
//! checks that gate it. Persistence happens inside the critical section and
//! the in-memory set is only touched after the store commits, so a failed
//! write leaves both sides unchanged. Callers do network I/O on snapshots,
//! outside the lock, and come back with mutations.

use crate::domain::entities::closed_trade::{CloseReason, ClosedTrade};
use crate::domain::entities::position::{NewPosition, Position, ProtectiveOrders};
use crate::domain::errors::{LedgerError, PositionLimitType, StoreError};
use crate::domain::repositories::ledger_store::{CloseOutcome, LedgerStore};
use crate::domain::services::partial_exit;
use crate::domain::services::pnl_calculator::pnl;
use crate::domain::services::trailing_stop::{is_monotonic, TrailingUpdate};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Limits for position management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionLimits {
    pub max_total: usize,
    pub max_per_symbol: usize,
}

impl Default for PositionLimits {
    fn default() -> Self {
        Self {
            max_total: 15,
            max_per_symbol: 1,
        }
    }
}

/// A mutation computed on a snapshot, applied later under the lock
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerMutation {
    Trail { id: i64, update: TrailingUpdate },
    PartialExit { id: i64, level: usize, price: Decimal },
    Close { id: i64, price: Decimal, reason: CloseReason },
}

impl LedgerMutation {
    pub fn position_id(&self) -> i64 {
        match self {
            LedgerMutation::Trail { id, .. }
            | LedgerMutation::PartialExit { id, .. }
            | LedgerMutation::Close { id, .. } => *id,
        }
    }
}

/// What an applied mutation did
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Stop and/or water-mark moved
    Trailed(Position),
    /// Part of the position closed; the position stays open as given
    Reduced { trade: ClosedTrade, position: Position },
    /// Position left the open set
    Closed(ClosedTrade),
}

/// Authoritative ledger of open positions
pub struct PositionLedger {
    open: Mutex<BTreeMap<i64, Position>>,
    store: Arc<dyn LedgerStore>,
    limits: PositionLimits,
}

impl PositionLedger {
    /// Rebuild the ledger from durable storage.
    pub async fn restore(
        store: Arc<dyn LedgerStore>,
        limits: PositionLimits,
    ) -> Result<Self, LedgerError> {
        let positions = store.load_open_positions().await?;
        let mut open = BTreeMap::new();
        for position in positions {
            if position.remaining_size <= Decimal::ZERO {
                return Err(LedgerError::NegativeRemaining {
                    id: position.id,
                    remaining: position.remaining_size,
                });
            }
            open.insert(position.id, position);
        }

        if open.len() > limits.max_total {
            warn!(
                "Restored {} open positions, above the configured maximum of {}",
                open.len(),
                limits.max_total
            );
        }
        info!("Position ledger restored with {} open positions", open.len());

        Ok(Self {
            open: Mutex::new(open),
            store,
            limits,
        })
    }

    pub fn limits(&self) -> PositionLimits {
        self.limits
    }

    fn check_limits_locked(
        &self,
        open: &BTreeMap<i64, Position>,
        symbol: &str,
    ) -> Result<(), LedgerError> {
        let total = open.len();
        if total >= self.limits.max_total {
            return Err(LedgerError::LimitExceeded {
                limit_type: PositionLimitType::Total,
                symbol: symbol.to_string(),
                current: total,
                limit: self.limits.max_total,
            });
        }

        let per_symbol = open.values().filter(|p| p.symbol == symbol).count();
        if per_symbol >= self.limits.max_per_symbol {
            return Err(LedgerError::LimitExceeded {
                limit_type: PositionLimitType::PerSymbol,
                symbol: symbol.to_string(),
                current: per_symbol,
                limit: self.limits.max_per_symbol,
            });
        }
        Ok(())
    }

    /// Advisory limit check for callers about to spend an exchange round-trip.
    /// `open` repeats the check authoritatively.
    pub async fn check_limits(&self, symbol: &str) -> Result<(), LedgerError> {
        let open = self.open.lock().await;
        self.check_limits_locked(&open, symbol)
    }

    /// Insert a new position. The limit check and the insert form one critical section.
    pub async fn open(&self, new: NewPosition) -> Result<i64, LedgerError> {
        new.validate()?;

        let mut open = self.open.lock().await;
        self.check_limits_locked(&open, &new.symbol)?;

        let id = self.store.insert_position(&new).await?;
        let position = Position::from_new(id, new);
        info!(
            "Opened {} {} {} #{} size {} @ {} (stop {})",
            position.status,
            position.side,
            position.symbol,
            id,
            position.original_size,
            position.entry_price,
            position.stop_loss
        );
        open.insert(id, position);
        Ok(id)
    }

    /// Snapshot of every open position
    pub async fn list_open(&self) -> Vec<Position> {
        self.open.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: i64) -> Option<Position> {
        self.open.lock().await.get(&id).cloned()
    }

    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }

    pub async fn apply_trailing_update(
        &self,
        id: i64,
        new_stop: Decimal,
        new_watermark: Decimal,
    ) -> Result<Position, LedgerError> {
        let mut open = self.open.lock().await;
        self.trail_locked(&mut open, id, new_stop, new_watermark).await
    }

    /// Fire partial level `level` at `price`. When the exit empties the
    /// position it becomes a full close carrying the partial reason.
    pub async fn apply_partial_exit(
        &self,
        id: i64,
        level: usize,
        price: Decimal,
    ) -> Result<ClosedTrade, LedgerError> {
        let mut open = self.open.lock().await;
        let (trade, _) = self.partial_locked(&mut open, id, level, price).await?;
        Ok(trade)
    }

    /// Move a position to history, realizing PnL on what remained open.
    pub async fn close(
        &self,
        id: i64,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedTrade, LedgerError> {
        let mut open = self.open.lock().await;
        self.close_locked(&mut open, id, close_price, reason, false).await
    }

    /// Close with a price known to be a last-resort estimate.
    pub async fn close_degraded(
        &self,
        id: i64,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedTrade, LedgerError> {
        let mut open = self.open.lock().await;
        self.close_locked(&mut open, id, close_price, reason, true).await
    }

    pub async fn set_protective_orders(
        &self,
        id: i64,
        orders: ProtectiveOrders,
    ) -> Result<(), LedgerError> {
        let mut open = self.open.lock().await;
        if !open.contains_key(&id) {
            return Err(LedgerError::PositionNotFound(id));
        }
        self.store.update_protective_orders(id, &orders).await?;
        if let Some(position) = open.get_mut(&id) {
            position.protective_orders = orders;
        }
        Ok(())
    }

    /// Apply a cycle's mutations under one lock acquisition.
    ///
    /// Each mutation commits or fails on its own; results come back in input order.
    pub async fn apply_batch(
        &self,
        mutations: Vec<LedgerMutation>,
    ) -> Vec<(LedgerMutation, Result<MutationOutcome, LedgerError>)> {
        let mut open = self.open.lock().await;
        let mut results = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            let result = match &mutation {
                LedgerMutation::Trail { id, update } => self
                    .trail_locked(&mut open, *id, update.stop_loss, update.watermark)
                    .await
                    .map(MutationOutcome::Trailed),
                LedgerMutation::PartialExit { id, level, price } => self
                    .partial_locked(&mut open, *id, *level, *price)
                    .await
                    .map(|(trade, position)| match position {
                        Some(position) => MutationOutcome::Reduced { trade, position },
                        None => MutationOutcome::Closed(trade),
                    }),
                LedgerMutation::Close { id, price, reason } => self
                    .close_locked(&mut open, *id, *price, *reason, false)
                    .await
                    .map(MutationOutcome::Closed),
            };
            results.push((mutation, result));
        }
        results
    }

    pub async fn closed_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>, LedgerError> {
        Ok(self.store.closed_trades(limit).await?)
    }

    pub async fn closed_trades_for(&self, position_id: i64) -> Result<Vec<ClosedTrade>, LedgerError> {
        Ok(self.store.closed_trades_for(position_id).await?)
    }

    /// Realized PnL over every closing event of one position
    pub async fn realized_pnl_for(&self, position_id: i64) -> Result<Decimal, LedgerError> {
        Ok(self
            .closed_trades_for(position_id)
            .await?
            .iter()
            .map(|trade| trade.pnl.amount)
            .sum())
    }

    async fn trail_locked(
        &self,
        open: &mut BTreeMap<i64, Position>,
        id: i64,
        new_stop: Decimal,
        new_watermark: Decimal,
    ) -> Result<Position, LedgerError> {
        let position = open.get(&id).ok_or(LedgerError::PositionNotFound(id))?;

        if !is_monotonic(position.side, position.stop_loss, new_stop) {
            return Err(LedgerError::StopRegression {
                id,
                current: position.stop_loss,
                proposed: new_stop,
            });
        }
        // A stale snapshot must not pull the water-mark back either
        let watermark = if position.side.is_favorable(position.watermark, new_watermark) {
            new_watermark
        } else {
            position.watermark
        };
        if watermark == position.watermark && new_stop == position.stop_loss {
            return Ok(position.clone());
        }

        self.store.update_risk_state(id, new_stop, watermark).await?;

        let position = open.get_mut(&id).ok_or(LedgerError::PositionNotFound(id))?;
        if new_stop != position.stop_loss {
            debug!(
                "Trailing stop for {} #{}: {} -> {} (watermark {})",
                position.symbol, id, position.stop_loss, new_stop, watermark
            );
        }
        position.stop_loss = new_stop;
        position.watermark = watermark;
        Ok(position.clone())
    }

    async fn partial_locked(
        &self,
        open: &mut BTreeMap<i64, Position>,
        id: i64,
        level: usize,
        price: Decimal,
    ) -> Result<(ClosedTrade, Option<Position>), LedgerError> {
        let position = open.get(&id).ok_or(LedgerError::PositionNotFound(id))?;
        let plan = partial_exit::plan(position, level).map_err(|rejection| {
            LedgerError::LevelUnavailable {
                id,
                level: level + 1,
                reason: rejection.to_string(),
            }
        })?;
        if plan.remaining_after < Decimal::ZERO {
            return Err(LedgerError::NegativeRemaining {
                id,
                remaining: plan.remaining_after,
            });
        }

        if plan.closes_position {
            let trade = self
                .close_locked(open, id, price, plan.reason, false)
                .await?;
            return Ok((trade, None));
        }

        let mut updated = position.clone();
        partial_exit::apply(&mut updated, &plan);
        let trade = ClosedTrade {
            position_id: id,
            symbol: position.symbol.clone(),
            side: position.side,
            status: position.status,
            entry_price: position.entry_price,
            close_price: price,
            quantity: plan.exit_qty,
            original_size: position.original_size,
            leverage: position.leverage,
            margin: position.margin - updated.margin,
            risk_amount: position.risk_amount - updated.risk_amount,
            stop_loss: updated.stop_loss,
            take_profit: position.take_profit,
            reason: plan.reason,
            pnl: pnl(position.entry_price, price, position.side, plan.exit_qty),
            degraded: false,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };

        self.store.record_partial_exit(&updated, &trade).await?;

        info!(
            "{} for {} #{}: closed {} @ {} ({}), remaining {}{}",
            trade.reason,
            trade.symbol,
            id,
            trade.quantity,
            price,
            trade.pnl,
            updated.remaining_size,
            plan.new_stop
                .map(|stop| format!(", stop moved to {}", stop))
                .unwrap_or_default()
        );
        open.insert(id, updated.clone());
        Ok((trade, Some(updated)))
    }

    async fn close_locked(
        &self,
        open: &mut BTreeMap<i64, Position>,
        id: i64,
        close_price: Decimal,
        reason: CloseReason,
        degraded: bool,
    ) -> Result<ClosedTrade, LedgerError> {
        let position = open.get(&id).ok_or(LedgerError::PositionNotFound(id))?;

        let trade = ClosedTrade {
            position_id: id,
            symbol: position.symbol.clone(),
            side: position.side,
            status: position.status,
            entry_price: position.entry_price,
            close_price,
            quantity: position.remaining_size,
            original_size: position.original_size,
            leverage: position.leverage,
            margin: position.margin,
            risk_amount: position.risk_amount,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            reason,
            pnl: pnl(position.entry_price, close_price, position.side, position.remaining_size),
            degraded,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };

        match self.store.record_close(&trade).await {
            Ok(CloseOutcome::Recorded) => {}
            Ok(CloseOutcome::DuplicateSkipped) => {
                warn!(
                    "Position {} #{} closed with an already recorded {} trade",
                    trade.symbol, id, reason
                );
            }
            Err(StoreError::MissingPosition(_)) => {
                // The store lost the row: drop the phantom rather than keep retrying
                warn!("Position #{} was missing from the store; removing it from memory", id);
                open.remove(&id);
                return Err(LedgerError::PositionNotFound(id));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Closed {} #{} ({}) {} @ {}: {}{}",
            trade.symbol,
            id,
            reason,
            trade.quantity,
            close_price,
            trade.pnl,
            if degraded { " [degraded price]" } else { "" }
        );
        open.remove(&id);
        Ok(trade)
    }
}
