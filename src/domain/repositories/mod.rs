pub mod exchange_client;
pub mod ledger_store;
pub mod notifier;
