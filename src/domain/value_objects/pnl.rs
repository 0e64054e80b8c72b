use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Decimal places kept for the percentage figure.
pub const PERCENT_SCALE: u32 = 4;

/// Realized or unrealized profit and loss
///
/// `amount` is exact (no rounding) so partial results add up to the whole.
/// `percent` is relative to entry notional and rounded half-up to
/// `PERCENT_SCALE` places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub amount: Decimal,
    pub percent: Decimal,
}

impl PnlBreakdown {
    pub fn zero() -> Self {
        Self {
            amount: Decimal::ZERO,
            percent: Decimal::ZERO,
        }
    }

    pub fn is_profit(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Amount rounded half-up to cents, for display and reporting.
    pub fn amount_cents(&self) -> Decimal {
        self.amount
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }
}

impl std::fmt::Display for PnlBreakdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cents = self.amount_cents();
        let percent = self
            .percent
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        if cents >= Decimal::ZERO {
            write!(f, "+${:.2} ({:+.2}%)", cents, percent)
        } else {
            write!(f, "-${:.2} ({:+.2}%)", cents.abs(), percent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_display_formats_sign_and_percent() {
        let gain = PnlBreakdown {
            amount: dec!(50.005),
            percent: dec!(5.0005),
        };
        assert_eq!(gain.to_string(), "+$50.01 (+5.00%)");

        let loss = PnlBreakdown {
            amount: dec!(-12.5),
            percent: dec!(-1.25),
        };
        assert_eq!(loss.to_string(), "-$12.50 (-1.25%)");
        assert!(loss.is_loss());
        assert!(!PnlBreakdown::zero().is_profit());
    }
}
