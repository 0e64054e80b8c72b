use crate::domain::entities::position::{Position, PositionSide};
use rust_decimal::Decimal;

/// New risk state produced by a trailing ratchet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingUpdate {
    pub watermark: Decimal,
    pub stop_loss: Decimal,
}

/// Inputs of the ratchet, detached from `Position` so it can be driven in isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingState {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub watermark: Decimal,
    pub stop_loss: Decimal,
    pub distance: Decimal,
}

impl TrailingState {
    pub fn from_position(position: &Position) -> Option<Self> {
        position.trailing_distance.map(|distance| TrailingState {
            side: position.side,
            entry_price: position.entry_price,
            watermark: position.watermark,
            stop_loss: position.stop_loss,
            distance,
        })
    }
}

/// Ratchet the water-mark and stop for a newly observed price.
///
/// The water-mark only moves in the favourable direction. The stop follows at
/// `distance` behind it, and only moves when the candidate beats both the
/// current stop and the entry price. Returns `None` when nothing changes, so
/// feeding the same price twice is a no-op.
pub fn evaluate(state: &TrailingState, price: Decimal) -> Option<TrailingUpdate> {
    if state.distance <= Decimal::ZERO {
        return None;
    }

    match state.side {
        PositionSide::Long => {
            let watermark = state.watermark.max(price);
            let candidate = watermark - state.distance;
            let stop_loss = if candidate > state.stop_loss && candidate > state.entry_price {
                candidate
            } else {
                state.stop_loss
            };
            changed(state, watermark, stop_loss)
        }
        PositionSide::Short => {
            let watermark = state.watermark.min(price);
            let candidate = watermark + state.distance;
            let stop_loss = if candidate < state.stop_loss && candidate < state.entry_price {
                candidate
            } else {
                state.stop_loss
            };
            changed(state, watermark, stop_loss)
        }
    }
}

fn changed(state: &TrailingState, watermark: Decimal, stop_loss: Decimal) -> Option<TrailingUpdate> {
    if watermark == state.watermark && stop_loss == state.stop_loss {
        None
    } else {
        Some(TrailingUpdate {
            watermark,
            stop_loss,
        })
    }
}

/// Whether `proposed` keeps the stop monotonic for `side`.
pub fn is_monotonic(side: PositionSide, current: Decimal, proposed: Decimal) -> bool {
    match side {
        PositionSide::Long => proposed >= current,
        PositionSide::Short => proposed <= current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn long_state() -> TrailingState {
        TrailingState {
            side: PositionSide::Long,
            entry_price: dec!(100),
            watermark: dec!(100),
            stop_loss: dec!(90),
            distance: dec!(5),
        }
    }

    fn apply(state: &mut TrailingState, price: Decimal) {
        if let Some(update) = evaluate(state, price) {
            state.watermark = update.watermark;
            state.stop_loss = update.stop_loss;
        }
    }

    #[test]
    fn test_long_raises_watermark_before_stop() {
        let state = long_state();
        // 103 - 5 = 98 is under entry: watermark moves, stop stays
        let update = evaluate(&state, dec!(103)).unwrap();
        assert_eq!(update.watermark, dec!(103));
        assert_eq!(update.stop_loss, dec!(90));
    }

    #[test]
    fn test_long_stop_trails_above_entry() {
        let mut state = long_state();
        apply(&mut state, dec!(120));
        assert_eq!(state.stop_loss, dec!(115));
        assert_eq!(state.watermark, dec!(120));

        // Pullback never lowers the stop
        assert_eq!(evaluate(&state, dec!(116)), None);
    }

    #[test]
    fn test_short_stop_trails_below_entry() {
        let mut state = TrailingState {
            side: PositionSide::Short,
            entry_price: dec!(100),
            watermark: dec!(100),
            stop_loss: dec!(110),
            distance: dec!(4),
        };
        apply(&mut state, dec!(97));
        // 97 + 4 = 101 is above entry
        assert_eq!(state.stop_loss, dec!(110));
        apply(&mut state, dec!(90));
        assert_eq!(state.stop_loss, dec!(94));
        assert_eq!(state.watermark, dec!(90));
        assert_eq!(evaluate(&state, dec!(93)), None);
    }

    #[test]
    fn test_repeated_input_is_idempotent() {
        let mut state = long_state();
        apply(&mut state, dec!(130));
        assert_eq!(evaluate(&state, dec!(130)), None);
    }

    #[test]
    fn test_break_even_stop_is_not_lowered() {
        let mut state = long_state();
        state.stop_loss = dec!(100);
        state.watermark = dec!(104);
        // 104 - 5 = 99 would undo the break-even move
        assert_eq!(evaluate(&state, dec!(103)), None);
    }

    proptest! {
        #[test]
        fn prop_long_stop_never_decreases(prices in prop::collection::vec(1i64..100_000, 1..200)) {
            let mut state = long_state();
            let mut last = state.stop_loss;
            for raw in prices {
                apply(&mut state, Decimal::new(raw, 2));
                prop_assert!(state.stop_loss >= last);
                last = state.stop_loss;
            }
        }

        #[test]
        fn prop_short_stop_never_increases(prices in prop::collection::vec(1i64..100_000, 1..200)) {
            let mut state = TrailingState {
                side: PositionSide::Short,
                entry_price: dec!(500),
                watermark: dec!(500),
                stop_loss: dec!(550),
                distance: dec!(7.5),
            };
            let mut last = state.stop_loss;
            for raw in prices {
                apply(&mut state, Decimal::new(raw, 2));
                prop_assert!(state.stop_loss <= last);
                last = state.stop_loss;
            }
        }
    }
}
