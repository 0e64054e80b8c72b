pub mod notifier;
pub mod paper_exchange;
