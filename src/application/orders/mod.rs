pub mod order_service;
pub mod retry_queue;
pub mod state_machine;

pub use order_service::OrderService;
pub use retry_queue::{EXPIRY_REASON, RetryQueue, RetryReport};
pub use state_machine::OrderLifecycleService;
