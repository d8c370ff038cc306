pub mod order_monitor;

pub use order_monitor::{TickReport, UnifiedOrderMonitor};
