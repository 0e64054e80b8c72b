use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Per-symbol trading increments published by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Minimum quantity increment (lot step)
    pub step_size: Decimal,
    /// Minimum price increment
    pub tick_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolRules {
    pub fn new(step_size: Decimal, tick_size: Decimal, min_qty: Decimal) -> Self {
        Self {
            step_size,
            tick_size,
            min_qty,
        }
    }

    /// Floor a quantity to the lot step. Never rounds up, so an order can not exceed what is held.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        floor_to_step(qty, self.step_size)
    }

    /// Round a price to the nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        let ticks = (price / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        (ticks * self.tick_size).normalize()
    }

    pub fn is_tradable(&self, qty: Decimal) -> bool {
        qty > Decimal::ZERO && qty >= self.min_qty
    }
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self {
            step_size: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::new(1, 3),
        }
    }
}

/// Floor `qty` to a multiple of `step`. A non-positive step leaves the value untouched.
pub fn floor_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    ((qty / step).floor() * step).normalize()
}
