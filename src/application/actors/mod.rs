pub mod position_monitor;

pub use position_monitor::*;
