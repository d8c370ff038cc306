pub mod broker;
pub mod in_memory;
pub mod mock;
pub mod notification;
pub mod persistence;

pub use in_memory::{
    InMemoryOrderRepository, InMemoryPositionRepository, InMemoryScheduleRepository,
    InMemoryServiceStatusRepository, InMemoryTrackingRepository,
};
pub use notification::{LogTransport, NotifyOutcome, RateLimitedNotifier};
