//! Database Models
//!
//! Row structs for the ledger tables and their conversion to domain types.
//! Decimals travel as canonical strings so nothing is lost to binary floats.

use crate::domain::entities::closed_trade::{CloseReason, ClosedTrade};
use crate::domain::entities::position::{
    PartialLevel, Position, PositionSide, PositionStatus, ProtectiveOrders, MAX_PARTIAL_LEVELS,
};
use crate::domain::errors::StoreError;
use crate::domain::value_objects::pnl::PnlBreakdown;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub symbol: String,
    pub side: String,   // "LONG" or "SHORT"
    pub status: String, // "ACTIVE" or "SIMULATED"
    pub entry_price: String,
    pub original_size: String,
    pub remaining_size: String,
    pub qty_step: String,
    pub leverage: i64,
    pub margin: String,
    pub risk_amount: String,
    pub stop_loss: String,
    pub take_profit: Option<String>,
    pub watermark: String,
    pub trailing_distance: Option<String>,
    pub partial_levels: String, // JSON
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub entry_order_id: Option<String>,
    pub opened_at_ms: i64,
    pub updated_at: DateTime<Utc>,
}

/// Closed trade record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClosedTradeRecord {
    pub id: i64,
    pub position_id: i64,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub entry_price: String,
    pub close_price: String,
    pub quantity: String,
    pub original_size: String,
    pub leverage: i64,
    pub margin: String,
    pub risk_amount: String,
    pub stop_loss: String,
    pub take_profit: Option<String>,
    pub close_reason: String,
    pub pnl_amount: String,
    pub pnl_percent: String,
    pub degraded: bool,
    pub opened_at_ms: i64,
    pub closed_at: DateTime<Utc>,
}

/// Reconciliation audit record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationAuditRecord {
    pub id: i64,
    pub run_at: DateTime<Utc>,
    pub exchange: String,
    pub exchange_positions: i64,
    pub checked: i64,
    pub ghosts_closed: i64,
    pub ghosts_in_grace: i64,
    pub degraded_closes: i64,
    pub failures: i64,
    pub details: String, // JSON
}

/// Canonical text form of a decimal column
pub fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value)
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", field, value, e)))
}

fn parse_optional_decimal(field: &str, value: Option<&str>) -> Result<Option<Decimal>, StoreError> {
    value.map(|v| parse_decimal(field, v)).transpose()
}

fn parse_side(value: &str) -> Result<PositionSide, StoreError> {
    PositionSide::parse(value).ok_or_else(|| StoreError::Corrupt(format!("side '{}'", value)))
}

fn parse_status(value: &str) -> Result<PositionStatus, StoreError> {
    PositionStatus::parse(value).ok_or_else(|| StoreError::Corrupt(format!("status '{}'", value)))
}

fn parse_leverage(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .ok()
        .filter(|l| *l > 0)
        .ok_or_else(|| StoreError::Corrupt(format!("leverage {}", value)))
}

pub fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {}", millis)))
}

pub fn encode_partial_levels(
    levels: &[Option<PartialLevel>; MAX_PARTIAL_LEVELS],
) -> Result<String, StoreError> {
    serde_json::to_string(levels).map_err(|e| StoreError::Corrupt(format!("partial levels: {}", e)))
}

fn decode_partial_levels(json: &str) -> Result<[Option<PartialLevel>; MAX_PARTIAL_LEVELS], StoreError> {
    let levels: Vec<Option<PartialLevel>> = serde_json::from_str(json)
        .map_err(|e| StoreError::Corrupt(format!("partial levels '{}': {}", json, e)))?;
    if levels.len() > MAX_PARTIAL_LEVELS {
        return Err(StoreError::Corrupt(format!(
            "{} partial levels stored, at most {} supported",
            levels.len(),
            MAX_PARTIAL_LEVELS
        )));
    }
    let mut slots: [Option<PartialLevel>; MAX_PARTIAL_LEVELS] = Default::default();
    for (slot, level) in slots.iter_mut().zip(levels) {
        *slot = level;
    }
    Ok(slots)
}

impl TryFrom<PositionRecord> for Position {
    type Error = StoreError;

    fn try_from(record: PositionRecord) -> Result<Self, Self::Error> {
        Ok(Position {
            id: record.id,
            side: parse_side(&record.side)?,
            status: parse_status(&record.status)?,
            entry_price: parse_decimal("entry_price", &record.entry_price)?,
            original_size: parse_decimal("original_size", &record.original_size)?,
            remaining_size: parse_decimal("remaining_size", &record.remaining_size)?,
            qty_step: parse_decimal("qty_step", &record.qty_step)?,
            leverage: parse_leverage(record.leverage)?,
            margin: parse_decimal("margin", &record.margin)?,
            risk_amount: parse_decimal("risk_amount", &record.risk_amount)?,
            stop_loss: parse_decimal("stop_loss", &record.stop_loss)?,
            take_profit: parse_optional_decimal("take_profit", record.take_profit.as_deref())?,
            watermark: parse_decimal("watermark", &record.watermark)?,
            trailing_distance: parse_optional_decimal(
                "trailing_distance",
                record.trailing_distance.as_deref(),
            )?,
            partial_levels: decode_partial_levels(&record.partial_levels)?,
            protective_orders: ProtectiveOrders {
                sl_order_id: record.sl_order_id,
                tp_order_id: record.tp_order_id,
            },
            entry_order_id: record.entry_order_id,
            opened_at: millis_to_datetime(record.opened_at_ms)?,
            symbol: record.symbol,
        })
    }
}

impl TryFrom<ClosedTradeRecord> for ClosedTrade {
    type Error = StoreError;

    fn try_from(record: ClosedTradeRecord) -> Result<Self, Self::Error> {
        let reason = CloseReason::parse(&record.close_reason)
            .ok_or_else(|| StoreError::Corrupt(format!("close reason '{}'", record.close_reason)))?;
        Ok(ClosedTrade {
            position_id: record.position_id,
            side: parse_side(&record.side)?,
            status: parse_status(&record.status)?,
            entry_price: parse_decimal("entry_price", &record.entry_price)?,
            close_price: parse_decimal("close_price", &record.close_price)?,
            quantity: parse_decimal("quantity", &record.quantity)?,
            original_size: parse_decimal("original_size", &record.original_size)?,
            leverage: parse_leverage(record.leverage)?,
            margin: parse_decimal("margin", &record.margin)?,
            risk_amount: parse_decimal("risk_amount", &record.risk_amount)?,
            stop_loss: parse_decimal("stop_loss", &record.stop_loss)?,
            take_profit: parse_optional_decimal("take_profit", record.take_profit.as_deref())?,
            reason,
            pnl: PnlBreakdown {
                amount: parse_decimal("pnl_amount", &record.pnl_amount)?,
                percent: parse_decimal("pnl_percent", &record.pnl_percent)?,
            },
            degraded: record.degraded,
            opened_at: millis_to_datetime(record.opened_at_ms)?,
            closed_at: record.closed_at,
            symbol: record.symbol,
        })
    }
}
