//! Durable storage behind the position ledger.
//!
//! Every method that touches both the open set and the history must do so in
//! one transaction: either both writes land or neither does.

use crate::domain::entities::closed_trade::ClosedTrade;
use crate::domain::entities::position::{NewPosition, Position, ProtectiveOrders};
use crate::domain::errors::StoreError;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Result of recording a full close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Position removed and history row written
    Recorded,
    /// Position removed; an identical history row already existed
    DuplicateSkipped,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Rebuild the open set, e.g. after a restart
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Persist a new position and return its id
    async fn insert_position(&self, position: &NewPosition) -> Result<i64, StoreError>;

    async fn update_risk_state(
        &self,
        id: i64,
        stop_loss: Decimal,
        watermark: Decimal,
    ) -> Result<(), StoreError>;

    async fn update_protective_orders(
        &self,
        id: i64,
        orders: &ProtectiveOrders,
    ) -> Result<(), StoreError>;

    /// Write the reduced position and its partial history row atomically.
    /// Fails with `StoreError::DuplicateTrade` if the row already exists.
    async fn record_partial_exit(
        &self,
        position: &Position,
        trade: &ClosedTrade,
    ) -> Result<(), StoreError>;

    /// Delete the position and write its final history row atomically.
    async fn record_close(&self, trade: &ClosedTrade) -> Result<CloseOutcome, StoreError>;

    /// Most recent closed trades, newest first
    async fn closed_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>, StoreError>;

    /// Every history row of one position, oldest first
    async fn closed_trades_for(&self, position_id: i64) -> Result<Vec<ClosedTrade>, StoreError>;
}
