use crate::domain::entities::closed_trade::CloseReason;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::services::trailing_stop::is_monotonic;
use crate::domain::value_objects::symbol_rules::floor_to_step;
use rust_decimal::Decimal;

/// Computed effect of firing one partial take-profit level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialExitPlan {
    /// Zero-based level index
    pub level: usize,
    pub exit_qty: Decimal,
    pub remaining_after: Decimal,
    pub risk_after: Decimal,
    pub margin_after: Decimal,
    /// Break-even stop, when the level asks for it and it tightens the stop
    pub new_stop: Option<Decimal>,
    pub reason: CloseReason,
    /// The exit empties the position; the ledger turns it into a full close
    pub closes_position: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialExitRejection {
    NotConfigured,
    AlreadyTaken,
    /// An earlier level is still pending
    OutOfOrder { pending: usize },
    QuantityBelowStep,
}

impl std::fmt::Display for PartialExitRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartialExitRejection::NotConfigured => write!(f, "level not configured"),
            PartialExitRejection::AlreadyTaken => write!(f, "level already taken"),
            PartialExitRejection::OutOfOrder { pending } => {
                write!(f, "level {} must fire first", pending + 1)
            }
            PartialExitRejection::QuantityBelowStep => {
                write!(f, "exit quantity rounds to zero at the lot step")
            }
        }
    }
}

/// The next untaken level, if the price has crossed its target.
///
/// Only one level can fire per evaluation even when the price gaps through
/// several targets.
pub fn triggered_level(position: &Position, price: Decimal) -> Option<usize> {
    let (index, level) = position.next_partial_level()?;
    let crossed = match position.side {
        PositionSide::Long => price >= level.target_price,
        PositionSide::Short => price <= level.target_price,
    };
    crossed.then_some(index)
}

/// Work out what firing `level` does to `position`, without touching it.
pub fn plan(position: &Position, level: usize) -> Result<PartialExitPlan, PartialExitRejection> {
    let config = position
        .partial_levels
        .get(level)
        .and_then(|slot| slot.as_ref())
        .ok_or(PartialExitRejection::NotConfigured)?;
    if config.taken {
        return Err(PartialExitRejection::AlreadyTaken);
    }
    if let Some((pending, _)) = position.next_partial_level() {
        if pending != level {
            return Err(PartialExitRejection::OutOfOrder { pending });
        }
    }

    let requested = floor_to_step(position.original_size * config.exit_fraction, position.qty_step);
    if requested <= Decimal::ZERO {
        return Err(PartialExitRejection::QuantityBelowStep);
    }

    // Whatever would be left below one lot step goes out with this exit
    let leftover = position.remaining_size - requested;
    let closes_position = leftover <= Decimal::ZERO
        || (position.qty_step > Decimal::ZERO && leftover < position.qty_step);
    let exit_qty = if closes_position {
        position.remaining_size
    } else {
        requested
    };
    let remaining_after = position.remaining_size - exit_qty;

    let keep = if position.remaining_size.is_zero() {
        Decimal::ZERO
    } else {
        remaining_after / position.remaining_size
    };

    let new_stop = (config.move_stop_to_break_even
        && position.entry_price != position.stop_loss
        && is_monotonic(position.side, position.stop_loss, position.entry_price))
    .then_some(position.entry_price);

    Ok(PartialExitPlan {
        level,
        exit_qty,
        remaining_after,
        risk_after: position.risk_amount * keep,
        margin_after: position.margin * keep,
        new_stop,
        reason: CloseReason::for_partial_level(level),
        closes_position,
    })
}

/// Apply a plan to a position copy. The caller persists the result.
pub fn apply(position: &mut Position, plan: &PartialExitPlan) {
    if let Some(level) = position.partial_levels[plan.level].as_mut() {
        level.taken = true;
    }
    position.remaining_size = plan.remaining_after;
    position.risk_amount = plan.risk_after;
    position.margin = plan.margin_after;
    if let Some(stop) = plan.new_stop {
        position.stop_loss = stop;
    }
}
