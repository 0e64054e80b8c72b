use rust_decimal::Decimal;
use thiserror::Error;

/// Rejected input on the way into the domain
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid leverage: {0}")]
    InvalidLeverage(u32),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Stop loss {stop} is on the wrong side of entry {entry}")]
    StopOnWrongSide { stop: Decimal, entry: Decimal },

    #[error("Take profit {take_profit} is on the wrong side of entry {entry}")]
    TakeProfitOnWrongSide { take_profit: Decimal, entry: Decimal },

    #[error("Invalid partial exit level {level}: {reason}")]
    InvalidPartialLevel { level: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionLimitType {
    PerSymbol,
    Total,
}

impl std::fmt::Display for PositionLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionLimitType::PerSymbol => write!(f, "per-symbol"),
            PositionLimitType::Total => write!(f, "total"),
        }
    }
}

/// Errors surfaced by the persistent store behind the ledger
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate closed trade for {symbol} ({reason})")]
    DuplicateTrade { symbol: String, reason: String },

    #[error("Position {0} missing from store")]
    MissingPosition(i64),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors returned by ledger operations. Every variant leaves the ledger unchanged.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Position limit exceeded ({limit_type}): {current}/{limit}")]
    LimitExceeded {
        limit_type: PositionLimitType,
        symbol: String,
        current: usize,
        limit: usize,
    },

    #[error("Position {0} is not open")]
    PositionNotFound(i64),

    #[error("Partial exit level {level} of position {id} cannot fire: {reason}")]
    LevelUnavailable { id: i64, level: usize, reason: String },

    #[error("Stop for position {id} would move against the position: {current} -> {proposed}")]
    StopRegression {
        id: i64,
        current: Decimal,
        proposed: Decimal,
    },

    #[error("Remaining size of position {id} would become negative ({remaining})")]
    NegativeRemaining { id: i64, remaining: Decimal },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Limit rejections are expected back-pressure, not faults.
    pub fn is_limit(&self) -> bool {
        matches!(self, LedgerError::LimitExceeded { .. })
    }
}
