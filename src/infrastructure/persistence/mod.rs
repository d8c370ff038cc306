pub mod database;
mod mapping;
mod order_repository;
mod position_repository;
mod schedule_repository;
mod tracking_repository;

pub use database::Database;
pub use order_repository::SqliteOrderRepository;
pub use position_repository::SqlitePositionRepository;
pub use schedule_repository::{SqliteScheduleRepository, SqliteServiceStatusRepository};
pub use tracking_repository::SqliteTrackingRepository;
