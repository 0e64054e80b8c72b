use crate::domain::entities::position::{PartialLevel, PositionSide};
use crate::domain::errors::ValidationError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade signal handed over by a strategy producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub leverage: Option<u32>,
    /// Overrides the configured trailing distance
    #[serde(default)]
    pub trailing_distance: Option<Decimal>,
    /// Overrides the configured partial levels
    #[serde(default)]
    pub partial_levels: Option<Vec<PartialLevel>>,
}

impl TradeSignal {
    pub fn new(
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            stop_loss,
            take_profit,
            size,
            leverage: None,
            trailing_distance: None,
            partial_levels: None,
        }
    }

    /// Cheap checks that do not need configuration or exchange rules.
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
        if !self.side.is_favorable(self.stop_loss, self.entry_price) {
            return Err(ValidationError::StopOnWrongSide {
                stop: self.stop_loss,
                entry: self.entry_price,
            });
        }
        if !self.side.is_favorable(self.entry_price, self.take_profit) {
            return Err(ValidationError::TakeProfitOnWrongSide {
                take_profit: self.take_profit,
                entry: self.entry_price,
            });
        }
        if let Some(levels) = &self.partial_levels {
            if levels.len() > crate::domain::entities::position::MAX_PARTIAL_LEVELS {
                return Err(ValidationError::InvalidPartialLevel {
                    level: levels.len(),
                    reason: "at most two partial levels are supported".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signal_validation() {
        let signal = TradeSignal::new(
            "ETHUSDT",
            PositionSide::Short,
            dec!(2000),
            dec!(2100),
            dec!(1800),
            dec!(1.5),
        );
        assert!(signal.validate().is_ok());

        let mut bad = signal.clone();
        bad.size = dec!(0);
        assert!(matches!(bad.validate(), Err(ValidationError::InvalidQuantity(_))));

        let mut bad = signal;
        bad.stop_loss = dec!(1900);
        assert!(matches!(bad.validate(), Err(ValidationError::StopOnWrongSide { .. })));
    }

    #[test]
    fn test_signal_deserializes_without_overrides() {
        let json = r#"{"symbol":"BTCUSDT","side":"Long","entry_price":"100","stop_loss":"95","take_profit":"120","size":"2"}"#;
        let signal: TradeSignal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.size, dec!(2));
        assert!(signal.leverage.is_none());
        assert!(signal.partial_levels.is_none());
    }
}
