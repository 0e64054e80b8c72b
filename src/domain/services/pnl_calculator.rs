use crate::domain::entities::position::PositionSide;
use crate::domain::value_objects::pnl::{PnlBreakdown, PERCENT_SCALE};
use rust_decimal::{Decimal, RoundingStrategy};

/// Profit and loss of moving `size` units from `entry` to `exit`.
///
/// LONG earns `(exit - entry) * size`, SHORT earns `(entry - exit) * size`.
/// The percentage is taken against entry notional.
///
/// # Panics
/// Panics when `entry` is zero. Positions are never created with a zero entry
/// price, so reaching this is a bug upstream.
pub fn pnl(entry: Decimal, exit: Decimal, side: PositionSide, size: Decimal) -> PnlBreakdown {
    assert!(!entry.is_zero(), "PnL requested for a zero entry price");

    let amount = match side {
        PositionSide::Long => (exit - entry) * size,
        PositionSide::Short => (entry - exit) * size,
    };

    let notional = entry * size;
    let percent = if notional.is_zero() {
        Decimal::ZERO
    } else {
        (amount / notional * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(PERCENT_SCALE, RoundingStrategy::MidpointAwayFromZero)
    };

    PnlBreakdown { amount, percent }
}

/// Unrealized PnL of an open quantity marked at `mark`.
pub fn unrealized(entry: Decimal, mark: Decimal, side: PositionSide, remaining: Decimal) -> PnlBreakdown {
    pnl(entry, mark, side, remaining)
}
