//! Repository Pattern Abstractions
//!
//! Traits separating the supervisor's business logic from storage. The
//! SQLite implementations live in `infrastructure::persistence`; tests use
//! in-memory doubles.

use crate::domain::types::{
    Order, OrderSide, OrderStatistics, OrderStatus, Position, ServiceStatus, TaskName,
    TaskSchedule, TrackingScope,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Control-surface listing filters.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub reason_contains: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Durable order store. The repository is the single writer of order rows;
/// all status changes flow through `update` after the state machine has
/// vetted them.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<()>;

    async fn update(&self, order: &Order) -> Result<()>;

    async fn find(&self, user_id: i64, local_id: &str) -> Result<Option<Order>>;

    async fn find_by_broker_id(&self, user_id: i64, broker_order_id: &str)
    -> Result<Option<Order>>;

    async fn find_by_status(&self, user_id: i64, status: OrderStatus) -> Result<Vec<Order>>;

    /// Orders in `pending` or `ongoing`, the monitor's working set.
    async fn find_active(&self, user_id: i64) -> Result<Vec<Order>>;

    async fn find_pending_for_symbol(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
    ) -> Result<Option<Order>>;

    async fn search(&self, user_id: i64, filter: &OrderFilter) -> Result<Vec<Order>>;

    async fn statistics(&self, user_id: i64) -> Result<OrderStatistics>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn upsert(&self, position: &Position) -> Result<()>;

    async fn find_open(&self, user_id: i64, symbol: &str) -> Result<Option<Position>>;

    async fn open_positions(&self, user_id: i64) -> Result<Vec<Position>>;

    async fn count_open(&self, user_id: i64) -> Result<usize>;
}

#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn upsert(&self, scope: &TrackingScope) -> Result<()>;

    async fn find(&self, user_id: i64, symbol: &str) -> Result<Option<TrackingScope>>;

    async fn active_scopes(&self, user_id: i64) -> Result<Vec<TrackingScope>>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn all(&self) -> Result<Vec<TaskSchedule>>;

    async fn find(&self, task: TaskName) -> Result<Option<TaskSchedule>>;

    async fn upsert(&self, schedule: &TaskSchedule) -> Result<()>;
}

#[async_trait]
pub trait ServiceStatusRepository: Send + Sync {
    async fn upsert(&self, status: &ServiceStatus) -> Result<()>;

    async fn find(&self, user_id: i64, task: TaskName) -> Result<Option<ServiceStatus>>;

    async fn for_user(&self, user_id: i64) -> Result<Vec<ServiceStatus>>;
}
