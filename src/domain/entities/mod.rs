pub mod closed_trade;
pub mod events;
pub mod position;
pub mod signal;
