use crate::domain::entities::closed_trade::ClosedTrade;
use crate::domain::entities::position::Position;
use rust_decimal::Decimal;
use serde::Serialize;

/// Lifecycle events published to the notification sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PositionEvent {
    Opened {
        position_id: i64,
        symbol: String,
        side: String,
        entry_price: Decimal,
        size: Decimal,
        simulated: bool,
    },
    PartialExit {
        trade: ClosedTrade,
        remaining_size: Decimal,
    },
    Closed {
        trade: ClosedTrade,
    },
    StopMoved {
        position_id: i64,
        symbol: String,
        stop_loss: Decimal,
        watermark: Decimal,
    },
    /// Ledger and exchange disagree and an operator should look
    Inconsistency {
        position_id: i64,
        symbol: String,
        detail: String,
    },
}

impl PositionEvent {
    pub fn opened(position: &Position) -> Self {
        PositionEvent::Opened {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side.to_string(),
            entry_price: position.entry_price,
            size: position.original_size,
            simulated: position.is_simulated(),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            PositionEvent::Opened { symbol, .. }
            | PositionEvent::StopMoved { symbol, .. }
            | PositionEvent::Inconsistency { symbol, .. } => symbol,
            PositionEvent::PartialExit { trade, .. } | PositionEvent::Closed { trade } => {
                &trade.symbol
            }
        }
    }

    /// One-line human summary used by log sinks
    pub fn summary(&self) -> String {
        match self {
            PositionEvent::Opened {
                position_id,
                symbol,
                side,
                entry_price,
                size,
                simulated,
            } => format!(
                "Opened {}{} {} #{} size {} @ {}",
                if *simulated { "[SIM] " } else { "" },
                side,
                symbol,
                position_id,
                size,
                entry_price
            ),
            PositionEvent::PartialExit {
                trade,
                remaining_size,
            } => format!(
                "{} {} #{}: closed {} @ {} ({}), remaining {}",
                trade.reason,
                trade.symbol,
                trade.position_id,
                trade.quantity,
                trade.close_price,
                trade.pnl,
                remaining_size
            ),
            PositionEvent::Closed { trade } => format!(
                "Closed {} #{} ({}) {} @ {}: {}{}",
                trade.symbol,
                trade.position_id,
                trade.reason,
                trade.quantity,
                trade.close_price,
                trade.pnl,
                if trade.degraded { " [degraded price]" } else { "" }
            ),
            PositionEvent::StopMoved {
                position_id,
                symbol,
                stop_loss,
                watermark,
            } => format!(
                "Trailing stop {} #{} -> {} (watermark {})",
                symbol, position_id, stop_loss, watermark
            ),
            PositionEvent::Inconsistency {
                position_id,
                symbol,
                detail,
            } => format!("Inconsistency on {} #{}: {}", symbol, position_id, detail),
        }
    }
}
