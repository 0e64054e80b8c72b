pub mod entry_executor;
pub mod partial_exit;
pub mod pnl_calculator;
pub mod portfolio_reconciliation;
pub mod position_ledger;
pub mod price_oracle;
pub mod trailing_stop;
