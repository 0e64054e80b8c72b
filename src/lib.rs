//! Tradekeeper Position Engine Library
//!
//! Position lifecycle and reconciliation engine: an authoritative ledger of
//! open positions, a monitor that trails stops and takes partial profits, and
//! a reconciliation pass that keeps the ledger honest against the exchange.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod retry;
