//! Time-driven orchestration: the per-user supervisor loop, the task
//! bodies it fires, schedule bookkeeping, and the service manager that
//! exposes start/stop/run-once.

pub mod scheduler;
pub mod service_manager;
pub mod supervisor;
pub mod tasks;

pub use scheduler::default_schedules;
pub use service_manager::{ServiceManager, ServiceMode};
pub use supervisor::{ExecutionState, UserSupervisor};
pub use tasks::TaskRunner;
