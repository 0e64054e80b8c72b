use crate::domain::errors::ValidationError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// At most two partial take-profit levels per position.
pub const MAX_PARTIAL_LEVELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(PositionSide::Long),
            "SHORT" | "SELL" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// True when moving from `from` to `to` is in the position's favour.
    pub fn is_favorable(&self, from: Decimal, to: Decimal) -> bool {
        match self {
            PositionSide::Long => to > from,
            PositionSide::Short => to < from,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIMULATED positions are paper trades and never touch the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Simulated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Simulated => "SIMULATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(PositionStatus::Active),
            "SIMULATED" => Some(PositionStatus::Simulated),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One partial take-profit level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialLevel {
    pub target_price: Decimal,
    /// Fraction of the original size to close, in (0, 1]
    pub exit_fraction: Decimal,
    pub move_stop_to_break_even: bool,
    pub taken: bool,
}

impl PartialLevel {
    pub fn new(target_price: Decimal, exit_fraction: Decimal, move_stop_to_break_even: bool) -> Self {
        Self {
            target_price,
            exit_fraction,
            move_stop_to_break_even,
            taken: false,
        }
    }
}

/// Exchange-side protective order ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

impl ProtectiveOrders {
    pub fn is_empty(&self) -> bool {
        self.sl_order_id.is_none() && self.tp_order_id.is_none()
    }

    pub fn order_ids(&self) -> impl Iterator<Item = &str> {
        self.sl_order_id
            .iter()
            .chain(self.tp_order_id.iter())
            .map(String::as_str)
    }
}

/// Input to `PositionLedger::open`. The ledger assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub qty_step: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub trailing_distance: Option<Decimal>,
    pub partial_levels: [Option<PartialLevel>; MAX_PARTIAL_LEVELS],
    pub protective_orders: ProtectiveOrders,
    pub entry_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl NewPosition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::InvalidSymbol(self.symbol.clone()));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(ValidationError::InvalidPrice(format!(
                "entry price must be positive, got {}",
                self.entry_price
            )));
        }
        if self.size <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(format!(
                "size must be positive, got {}",
                self.size
            )));
        }
        if self.qty_step < Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(format!(
                "quantity step must not be negative, got {}",
                self.qty_step
            )));
        }
        if self.leverage == 0 {
            return Err(ValidationError::InvalidLeverage(self.leverage));
        }
        if self.stop_loss <= Decimal::ZERO || !self.side.is_favorable(self.stop_loss, self.entry_price) {
            return Err(ValidationError::StopOnWrongSide {
                stop: self.stop_loss,
                entry: self.entry_price,
            });
        }
        if let Some(tp) = self.take_profit {
            if !self.side.is_favorable(self.entry_price, tp) {
                return Err(ValidationError::TakeProfitOnWrongSide {
                    take_profit: tp,
                    entry: self.entry_price,
                });
            }
        }
        if let Some(distance) = self.trailing_distance {
            if distance <= Decimal::ZERO {
                return Err(ValidationError::InvalidPrice(format!(
                    "trailing distance must be positive, got {}",
                    distance
                )));
            }
        }
        self.validate_partial_levels()
    }

    fn validate_partial_levels(&self) -> Result<(), ValidationError> {
        let mut previous_target = self.entry_price;
        let mut total_fraction = Decimal::ZERO;
        let mut seen_gap = false;

        for (index, slot) in self.partial_levels.iter().enumerate() {
            let Some(level) = slot else {
                seen_gap = true;
                continue;
            };
            let invalid = |reason: &str| ValidationError::InvalidPartialLevel {
                level: index + 1,
                reason: reason.to_string(),
            };
            if seen_gap {
                return Err(invalid("levels must be filled in order"));
            }
            if level.taken {
                return Err(invalid("level is already taken"));
            }
            if level.exit_fraction <= Decimal::ZERO || level.exit_fraction > Decimal::ONE {
                return Err(invalid("exit fraction must be in (0, 1]"));
            }
            if !self.side.is_favorable(previous_target, level.target_price) {
                return Err(invalid("target must lie beyond entry and the previous level"));
            }
            total_fraction += level.exit_fraction;
            previous_target = level.target_price;
        }

        if total_fraction > Decimal::ONE {
            return Err(ValidationError::InvalidPartialLevel {
                level: MAX_PARTIAL_LEVELS,
                reason: format!("exit fractions sum to {} (> 1)", total_fraction),
            });
        }
        Ok(())
    }
}

/// An open position. Only the ledger mutates these; everyone else works on snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub original_size: Decimal,
    pub remaining_size: Decimal,
    pub qty_step: Decimal,
    pub leverage: u32,
    /// Margin committed for the remaining size
    pub margin: Decimal,
    /// Loss at the initial stop for the remaining size
    pub risk_amount: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    /// High-water mark for LONG, low-water mark for SHORT
    pub watermark: Decimal,
    pub trailing_distance: Option<Decimal>,
    pub partial_levels: [Option<PartialLevel>; MAX_PARTIAL_LEVELS],
    pub protective_orders: ProtectiveOrders,
    pub entry_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Materialize a validated `NewPosition` under the id assigned by the store.
    pub fn from_new(id: i64, new: NewPosition) -> Self {
        let margin = new.entry_price * new.size / Decimal::from(new.leverage);
        let risk_amount = (new.entry_price - new.stop_loss).abs() * new.size;
        Position {
            id,
            symbol: new.symbol,
            side: new.side,
            status: new.status,
            entry_price: new.entry_price,
            original_size: new.size,
            remaining_size: new.size,
            qty_step: new.qty_step,
            leverage: new.leverage,
            margin,
            risk_amount,
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            watermark: new.entry_price,
            trailing_distance: new.trailing_distance,
            partial_levels: new.partial_levels,
            protective_orders: new.protective_orders,
            entry_order_id: new.entry_order_id,
            opened_at: new.opened_at,
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.status == PositionStatus::Simulated
    }

    /// The only level allowed to fire next: the first untaken one.
    pub fn next_partial_level(&self) -> Option<(usize, &PartialLevel)> {
        self.partial_levels
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|level| (index, level)))
            .find(|(_, level)| !level.taken)
    }

    pub fn levels_taken(&self) -> usize {
        self.partial_levels
            .iter()
            .flatten()
            .filter(|level| level.taken)
            .count()
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.remaining_size * price
    }

    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop_loss,
            PositionSide::Short => price >= self.stop_loss,
        }
    }

    pub fn take_profit_hit(&self, price: Decimal) -> bool {
        match (self.side, self.take_profit) {
            (PositionSide::Long, Some(tp)) => price >= tp,
            (PositionSide::Short, Some(tp)) => price <= tp,
            (_, None) => false,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }
}

/// Current time truncated to milliseconds, the precision positions are stored with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> NewPosition {
        NewPosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            status: PositionStatus::Active,
            entry_price: dec!(100),
            size: dec!(10),
            qty_step: dec!(0.001),
            leverage: 5,
            stop_loss: dec!(90),
            take_profit: Some(dec!(130)),
            trailing_distance: Some(dec!(5)),
            partial_levels: [
                Some(PartialLevel::new(dec!(110), dec!(0.5), true)),
                Some(PartialLevel::new(dec!(120), dec!(0.25), false)),
            ],
            protective_orders: ProtectiveOrders::default(),
            entry_order_id: None,
            opened_at: now_millis(),
        }
    }

    #[test]
    fn test_valid_position_passes() {
        assert!(long_position().validate().is_ok());
    }

    #[test]
    fn test_stop_on_wrong_side_rejected() {
        let mut new = long_position();
        new.stop_loss = dec!(101);
        assert!(matches!(
            new.validate(),
            Err(ValidationError::StopOnWrongSide { .. })
        ));
    }

    #[test]
    fn test_short_take_profit_must_be_below_entry() {
        let mut new = long_position();
        new.side = PositionSide::Short;
        new.stop_loss = dec!(110);
        new.partial_levels = [None, None];
        assert!(matches!(
            new.validate(),
            Err(ValidationError::TakeProfitOnWrongSide { .. })
        ));
        new.take_profit = Some(dec!(80));
        assert!(new.validate().is_ok());
    }

    #[test]
    fn test_partial_levels_must_be_ordered() {
        let mut new = long_position();
        new.partial_levels[1] = Some(PartialLevel::new(dec!(105), dec!(0.25), false));
        assert!(matches!(
            new.validate(),
            Err(ValidationError::InvalidPartialLevel { level: 2, .. })
        ));
    }

    #[test]
    fn test_partial_levels_cannot_skip_first_slot() {
        let mut new = long_position();
        new.partial_levels = [None, Some(PartialLevel::new(dec!(110), dec!(0.5), true))];
        assert!(new.validate().is_err());
    }

    #[test]
    fn test_partial_fractions_cannot_exceed_size() {
        let mut new = long_position();
        new.partial_levels[1] = Some(PartialLevel::new(dec!(120), dec!(0.6), false));
        assert!(new.validate().is_err());
    }

    #[test]
    fn test_from_new_computes_margin_and_risk() {
        let position = Position::from_new(1, long_position());
        assert_eq!(position.margin, dec!(200));
        assert_eq!(position.risk_amount, dec!(100));
        assert_eq!(position.watermark, dec!(100));
        assert_eq!(position.remaining_size, dec!(10));
    }

    #[test]
    fn test_next_partial_level_is_strictly_ordered() {
        let mut position = Position::from_new(1, long_position());
        assert_eq!(position.next_partial_level().map(|(i, _)| i), Some(0));
        if let Some(level) = position.partial_levels[0].as_mut() {
            level.taken = true;
        }
        assert_eq!(position.next_partial_level().map(|(i, _)| i), Some(1));
        assert_eq!(position.levels_taken(), 1);
    }

    #[test]
    fn test_stop_and_take_profit_hits() {
        let position = Position::from_new(1, long_position());
        assert!(position.stop_hit(dec!(90)));
        assert!(!position.stop_hit(dec!(90.01)));
        assert!(position.take_profit_hit(dec!(130)));
        assert!(!position.take_profit_hit(dec!(129.99)));
    }
}
