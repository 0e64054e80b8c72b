//! Database Repository
//!
//! SQLite implementation of `LedgerStore`.

use super::models::*;
use super::DbPool;
use crate::domain::entities::closed_trade::ClosedTrade;
use crate::domain::entities::position::{NewPosition, Position, ProtectiveOrders};
use crate::domain::errors::StoreError;
use crate::domain::repositories::ledger_store::{CloseOutcome, LedgerStore};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, error, warn};

/// Ledger store backed by the `positions` and `closed_trades` tables
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: DbPool,
}

impl SqliteLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn trade_exists(
        tx: &mut Transaction<'_, Sqlite>,
        trade: &ClosedTrade,
    ) -> Result<bool, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM closed_trades
            WHERE symbol = ?1 AND entry_price = ?2 AND opened_at_ms = ?3 AND close_reason = ?4
            "#,
        )
        .bind(&trade.symbol)
        .bind(decimal_text(trade.entry_price))
        .bind(trade.opened_at.timestamp_millis())
        .bind(trade.reason.as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(count > 0)
    }

    async fn insert_trade(
        tx: &mut Transaction<'_, Sqlite>,
        trade: &ClosedTrade,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO closed_trades (
                position_id, symbol, side, status, entry_price, close_price, quantity,
                original_size, leverage, margin, risk_amount, stop_loss, take_profit,
                close_reason, pnl_amount, pnl_percent, degraded, opened_at_ms, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
        )
        .bind(trade.position_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.status.as_str())
        .bind(decimal_text(trade.entry_price))
        .bind(decimal_text(trade.close_price))
        .bind(decimal_text(trade.quantity))
        .bind(decimal_text(trade.original_size))
        .bind(i64::from(trade.leverage))
        .bind(decimal_text(trade.margin))
        .bind(decimal_text(trade.risk_amount))
        .bind(decimal_text(trade.stop_loss))
        .bind(trade.take_profit.map(decimal_text))
        .bind(trade.reason.as_str())
        .bind(decimal_text(trade.pnl.amount))
        .bind(decimal_text(trade.pnl.percent))
        .bind(trade.degraded)
        .bind(trade.opened_at.timestamp_millis())
        .bind(trade.closed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let records = sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load open positions: {}", e);
                StoreError::Database(e)
            })?;

        records.into_iter().map(Position::try_from).collect()
    }

    async fn insert_position(&self, position: &NewPosition) -> Result<i64, StoreError> {
        let margin = position.entry_price * position.size / Decimal::from(position.leverage);
        let risk_amount = (position.entry_price - position.stop_loss).abs() * position.size;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO positions (
                symbol, side, status, entry_price, original_size, remaining_size, qty_step,
                leverage, margin, risk_amount, stop_loss, take_profit, watermark,
                trailing_distance, partial_levels, sl_order_id, tp_order_id, entry_order_id,
                opened_at_ms, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?4, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            RETURNING id
            "#,
        )
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.status.as_str())
        .bind(decimal_text(position.entry_price))
        .bind(decimal_text(position.size))
        .bind(decimal_text(position.qty_step))
        .bind(i64::from(position.leverage))
        .bind(decimal_text(margin))
        .bind(decimal_text(risk_amount))
        .bind(decimal_text(position.stop_loss))
        .bind(position.take_profit.map(decimal_text))
        .bind(position.trailing_distance.map(decimal_text))
        .bind(encode_partial_levels(&position.partial_levels)?)
        .bind(&position.protective_orders.sl_order_id)
        .bind(&position.protective_orders.tp_order_id)
        .bind(&position.entry_order_id)
        .bind(position.opened_at.timestamp_millis())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert position for {}: {}", position.symbol, e);
            StoreError::Database(e)
        })?;

        debug!("Inserted position {} for {}", id, position.symbol);
        Ok(id)
    }

    async fn update_risk_state(
        &self,
        id: i64,
        stop_loss: Decimal,
        watermark: Decimal,
    ) -> Result<(), StoreError> {
        let rows_affected = sqlx::query(
            "UPDATE positions SET stop_loss = ?1, watermark = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(decimal_text(stop_loss))
        .bind(decimal_text(watermark))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingPosition(id));
        }
        debug!("Updated risk state of position {}: stop {} watermark {}", id, stop_loss, watermark);
        Ok(())
    }

    async fn update_protective_orders(
        &self,
        id: i64,
        orders: &ProtectiveOrders,
    ) -> Result<(), StoreError> {
        let rows_affected = sqlx::query(
            "UPDATE positions SET sl_order_id = ?1, tp_order_id = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(&orders.sl_order_id)
        .bind(&orders.tp_order_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingPosition(id));
        }
        Ok(())
    }

    async fn record_partial_exit(
        &self,
        position: &Position,
        trade: &ClosedTrade,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if Self::trade_exists(&mut tx, trade).await? {
            warn!(
                "Duplicate {} for {} position {} rejected",
                trade.reason, trade.symbol, trade.position_id
            );
            return Err(StoreError::DuplicateTrade {
                symbol: trade.symbol.clone(),
                reason: trade.reason.to_string(),
            });
        }

        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET remaining_size = ?1, risk_amount = ?2, margin = ?3, stop_loss = ?4,
                partial_levels = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(decimal_text(position.remaining_size))
        .bind(decimal_text(position.risk_amount))
        .bind(decimal_text(position.margin))
        .bind(decimal_text(position.stop_loss))
        .bind(encode_partial_levels(&position.partial_levels)?)
        .bind(Utc::now())
        .bind(position.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingPosition(position.id));
        }

        Self::insert_trade(&mut tx, trade).await?;
        tx.commit().await?;

        debug!(
            "Recorded {} for position {}: {} closed, {} remaining",
            trade.reason, position.id, trade.quantity, position.remaining_size
        );
        Ok(())
    }

    async fn record_close(&self, trade: &ClosedTrade) -> Result<CloseOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let duplicate = Self::trade_exists(&mut tx, trade).await?;

        let rows_affected = sqlx::query("DELETE FROM positions WHERE id = ?1")
            .bind(trade.position_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingPosition(trade.position_id));
        }

        let outcome = if duplicate {
            warn!(
                "Closed trade for {} ({}) already recorded, skipping insert",
                trade.symbol, trade.reason
            );
            CloseOutcome::DuplicateSkipped
        } else {
            Self::insert_trade(&mut tx, trade).await?;
            CloseOutcome::Recorded
        };

        tx.commit().await?;
        debug!("Closed position {} ({})", trade.position_id, trade.reason);
        Ok(outcome)
    }

    async fn closed_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>, StoreError> {
        let records = sqlx::query_as::<_, ClosedTradeRecord>(
            "SELECT * FROM closed_trades ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(ClosedTrade::try_from).collect()
    }

    async fn closed_trades_for(&self, position_id: i64) -> Result<Vec<ClosedTrade>, StoreError> {
        let records = sqlx::query_as::<_, ClosedTradeRecord>(
            "SELECT * FROM closed_trades WHERE position_id = ?1 ORDER BY id ASC",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(ClosedTrade::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::closed_trade::CloseReason;
    use crate::domain::entities::position::{now_millis, PartialLevel, PositionSide, PositionStatus};
    use crate::domain::services::pnl_calculator::pnl;
    use crate::persistence::{init_database, DatabaseConfig};
    use rust_decimal_macros::dec;

    async fn store() -> SqliteLedgerStore {
        let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
        SqliteLedgerStore::new(pool)
    }

    fn new_position() -> NewPosition {
        NewPosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            status: PositionStatus::Active,
            entry_price: dec!(100),
            size: dec!(10),
            qty_step: dec!(0.001),
            leverage: 4,
            stop_loss: dec!(95),
            take_profit: Some(dec!(120)),
            trailing_distance: Some(dec!(5)),
            partial_levels: [Some(PartialLevel::new(dec!(110), dec!(0.5), true)), None],
            protective_orders: ProtectiveOrders {
                sl_order_id: Some("sl-1".into()),
                tp_order_id: None,
            },
            entry_order_id: Some("open-1".into()),
            opened_at: now_millis(),
        }
    }

    fn closing_trade(position: &Position, reason: CloseReason, price: Decimal) -> ClosedTrade {
        ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            status: position.status,
            entry_price: position.entry_price,
            close_price: price,
            quantity: position.remaining_size,
            original_size: position.original_size,
            leverage: position.leverage,
            margin: position.margin,
            risk_amount: position.risk_amount,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            reason,
            pnl: pnl(position.entry_price, price, position.side, position.remaining_size),
            degraded: false,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let store = store().await;
        let new = new_position();
        let id = store.insert_position(&new).await.unwrap();

        let loaded = store.load_open_positions().await.unwrap();
        assert_eq!(loaded, vec![Position::from_new(id, new)]);
    }

    #[tokio::test]
    async fn test_close_moves_position_to_history() {
        let store = store().await;
        let id = store.insert_position(&new_position()).await.unwrap();
        let position = store.load_open_positions().await.unwrap().remove(0);
        assert_eq!(position.id, id);

        let trade = closing_trade(&position, CloseReason::TakeProfit, dec!(120));
        assert_eq!(store.record_close(&trade).await.unwrap(), CloseOutcome::Recorded);

        assert!(store.load_open_positions().await.unwrap().is_empty());
        let history = store.closed_trades_for(id).await.unwrap();
        assert_eq!(history, vec![trade]);
    }

    #[tokio::test]
    async fn test_duplicate_partial_is_rejected_atomically() {
        let store = store().await;
        let id = store.insert_position(&new_position()).await.unwrap();
        let mut position = store.load_open_positions().await.unwrap().remove(0);

        let mut trade = closing_trade(&position, CloseReason::PartialTp1, dec!(110));
        trade.quantity = dec!(5);
        position.remaining_size = dec!(5);
        store.record_partial_exit(&position, &trade).await.unwrap();

        let mut again = position.clone();
        again.remaining_size = dec!(0.5);
        let err = store.record_partial_exit(&again, &trade).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTrade { .. }));

        let reloaded = store.load_open_positions().await.unwrap().remove(0);
        assert_eq!(reloaded.remaining_size, dec!(5));
        assert_eq!(store.closed_trades_for(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_of_missing_position_rolls_back() {
        let store = store().await;
        store.insert_position(&new_position()).await.unwrap();
        let mut position = store.load_open_positions().await.unwrap().remove(0);
        position.id += 100;

        let trade = closing_trade(&position, CloseReason::Manual, dec!(101));
        assert!(matches!(
            store.record_close(&trade).await,
            Err(StoreError::MissingPosition(_))
        ));
        assert!(store.closed_trades(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_state_update_persists() {
        let store = store().await;
        let id = store.insert_position(&new_position()).await.unwrap();
        store.update_risk_state(id, dec!(101), dec!(106)).await.unwrap();

        let position = store.load_open_positions().await.unwrap().remove(0);
        assert_eq!(position.stop_loss, dec!(101));
        assert_eq!(position.watermark, dec!(106));
        assert!(matches!(
            store.update_risk_state(id + 1, dec!(1), dec!(1)).await,
            Err(StoreError::MissingPosition(_))
        ));
    }
}
