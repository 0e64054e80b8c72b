//! Exchange Client Trait
//!
//! This module defines the `ExchangeClient` trait, the single seam between the
//! position engine and a derivatives exchange. The engine never talks HTTP or
//! WebSocket itself; it consumes fills, open positions, account trades and
//! ticker prices through this interface.
//!
//! Quantities and prices handed to the order methods must already be rounded
//! to the symbol's step and tick size (see `SymbolRules`).

use crate::domain::entities::position::{PositionSide, ProtectiveOrders};
use crate::domain::value_objects::symbol_rules::SymbolRules;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// Request did not complete within the call timeout
    #[error("Request timed out: {0}")]
    Timeout(String),
    /// Exchange rate limit hit
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// Connection reset, DNS failure, 5xx and similar
    #[error("Network error: {0}")]
    Network(String),
    /// Unknown or delisted symbol
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),
    /// Order parameters rejected by the exchange
    #[error("Order rejected: {0}")]
    OrderRejected(String),
    /// Malformed request built locally
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying; everything else needs an operator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::RateLimited(_) | ExchangeError::Network(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ExchangeError::Timeout(_) => "TIMEOUT",
            ExchangeError::RateLimited(_) => "RATE_LIMITED",
            ExchangeError::Network(_) => "NETWORK",
            ExchangeError::InvalidSymbol(_) => "INVALID_SYMBOL",
            ExchangeError::OrderRejected(_) => "ORDER_REJECTED",
            ExchangeError::InvalidOrder(_) => "INVALID_ORDER",
            ExchangeError::Authentication(_) => "AUTHENTICATION",
        }
    }
}

/// Execution report for a market order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub qty: Decimal,
}

/// A position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed amount: positive long, negative short
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
}

impl ExchangePosition {
    pub fn is_open(&self) -> bool {
        !self.amount.is_zero()
    }
}

/// A fill from the account's trade history
#[derive(Debug, Clone, PartialEq)]
pub struct AccountTrade {
    pub symbol: String,
    pub order_id: String,
    pub price: Decimal,
    pub qty: Decimal,
    /// Non-zero only for fills that reduced a position
    pub realized_pnl: Decimal,
    pub time: DateTime<Utc>,
}

/// Exchange client trait providing the engine's view of the exchange
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Get the name of this exchange
    fn name(&self) -> &str;

    /// Open a position with a market order
    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        leverage: u32,
    ) -> ExchangeResult<Fill>;

    /// Reduce-only market order shrinking the open position on `symbol`
    async fn close(&self, symbol: &str, qty: Decimal) -> ExchangeResult<Fill>;

    /// Cancel a resting order
    async fn cancel(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Place stop-loss and take-profit orders for `qty`
    async fn place_protective(
        &self,
        symbol: &str,
        stop_price: Decimal,
        tp_price: Option<Decimal>,
        qty: Decimal,
    ) -> ExchangeResult<ProtectiveOrders>;

    /// Authoritative list of open positions
    async fn open_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    /// Account fills for `symbol` at or after `since`
    async fn account_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> ExchangeResult<Vec<AccountTrade>>;

    /// Latest traded price
    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Step and tick size for `symbol`
    async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules>;

    /// Check if the exchange is reachable
    async fn is_healthy(&self) -> bool {
        true
    }
}
