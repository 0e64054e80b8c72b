use crate::domain::entities::position::{PositionSide, PositionStatus};
use crate::domain::value_objects::pnl::PnlBreakdown;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    PartialTp1,
    PartialTp2,
    /// Closed on the exchange without the monitor seeing it
    ExternalClose,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::PartialTp1 => "PARTIAL_TP_1",
            CloseReason::PartialTp2 => "PARTIAL_TP_2",
            CloseReason::ExternalClose => "EXTERNAL_CLOSE",
            CloseReason::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STOP_LOSS" => Some(CloseReason::StopLoss),
            "TAKE_PROFIT" => Some(CloseReason::TakeProfit),
            "PARTIAL_TP_1" => Some(CloseReason::PartialTp1),
            "PARTIAL_TP_2" => Some(CloseReason::PartialTp2),
            "EXTERNAL_CLOSE" => Some(CloseReason::ExternalClose),
            "MANUAL" => Some(CloseReason::Manual),
            _ => None,
        }
    }

    /// Reason recorded for the partial exit at zero-based `level`.
    pub fn for_partial_level(level: usize) -> Self {
        if level == 0 {
            CloseReason::PartialTp1
        } else {
            CloseReason::PartialTp2
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, CloseReason::PartialTp1 | CloseReason::PartialTp2)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable history record for the quantity removed by one closing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub close_price: Decimal,
    /// Quantity closed by this event
    pub quantity: Decimal,
    pub original_size: Decimal,
    pub leverage: u32,
    pub margin: Decimal,
    pub risk_amount: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub reason: CloseReason,
    pub pnl: PnlBreakdown,
    /// Close price fell back to entry because nothing better was known
    pub degraded: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    /// Fields that identify a closing event across retries and restarts.
    pub fn idempotency_key(&self) -> (String, Decimal, i64, CloseReason) {
        (
            self.symbol.clone(),
            self.entry_price.normalize(),
            self.opened_at.timestamp_millis(),
            self.reason,
        )
    }
}
