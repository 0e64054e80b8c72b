pub mod pnl;
pub mod symbol_rules;
