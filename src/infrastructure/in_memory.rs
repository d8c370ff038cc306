//! Thread-safe in-memory repository implementations used by tests and by
//! the mock broker mode. They enforce the same transition table as the
//! SQLite repositories.

use crate::domain::errors::TransitionError;
use crate::domain::order_lifecycle::transition_allowed;
use crate::domain::repositories::{
    OrderFilter, OrderRepository, PositionRepository, ScheduleRepository,
    ServiceStatusRepository, TrackingRepository,
};
use crate::domain::types::{
    Order, OrderSide, OrderStatistics, OrderStatus, Position, ServiceStatus, TaskName,
    TaskSchedule, TrackingScope,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<(i64, String), Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().unwrap();
        orders
            .entry((order.user_id, order.local_id.clone()))
            .or_insert_with(|| order.clone());
        Ok(())
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().unwrap();
        let key = (order.user_id, order.local_id.clone());
        let stored = orders
            .get(&key)
            .with_context(|| format!("Order {} not found for update", order.local_id))?;

        if stored.status != order.status {
            if stored.status.is_terminal() {
                return Err(TransitionError::Terminal {
                    local_id: order.local_id.clone(),
                    status: stored.status,
                }
                .into());
            }
            if !transition_allowed(stored.status, order.status) {
                return Err(TransitionError::Illegal {
                    local_id: order.local_id.clone(),
                    from: stored.status,
                    to: order.status,
                }
                .into());
            }
        }

        orders.insert(key, order.clone());
        Ok(())
    }

    async fn find(&self, user_id: i64, local_id: &str) -> Result<Option<Order>> {
        let orders = self.orders.read().unwrap();
        Ok(orders.get(&(user_id, local_id.to_string())).cloned())
    }

    async fn find_by_broker_id(
        &self,
        user_id: i64,
        broker_order_id: &str,
    ) -> Result<Option<Order>> {
        let orders = self.orders.read().unwrap();
        Ok(orders
            .values()
            .find(|o| {
                o.user_id == user_id && o.broker_order_id.as_deref() == Some(broker_order_id)
            })
            .cloned())
    }

    async fn find_by_status(&self, user_id: i64, status: OrderStatus) -> Result<Vec<Order>> {
        let orders = self.orders.read().unwrap();
        let mut found: Vec<Order> = orders
            .values()
            .filter(|o| o.user_id == user_id && o.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|o| o.placed_at);
        Ok(found)
    }

    async fn find_active(&self, user_id: i64) -> Result<Vec<Order>> {
        let orders = self.orders.read().unwrap();
        let mut found: Vec<Order> = orders
            .values()
            .filter(|o| o.user_id == user_id && o.is_active())
            .cloned()
            .collect();
        found.sort_by_key(|o| o.placed_at);
        Ok(found)
    }

    async fn find_pending_for_symbol(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
    ) -> Result<Option<Order>> {
        let orders = self.orders.read().unwrap();
        Ok(orders
            .values()
            .find(|o| {
                o.user_id == user_id
                    && o.symbol == symbol
                    && o.side == side
                    && o.status == OrderStatus::Pending
            })
            .cloned())
    }

    async fn search(&self, user_id: i64, filter: &OrderFilter) -> Result<Vec<Order>> {
        let orders = self.orders.read().unwrap();
        let mut found: Vec<Order> = orders
            .values()
            .filter(|o| o.user_id == user_id)
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .filter(|o| {
                filter.reason_contains.as_ref().is_none_or(|needle| {
                    o.reason.as_ref().is_some_and(|r| r.contains(needle))
                })
            })
            .filter(|o| filter.from.is_none_or(|from| o.placed_at >= from))
            .filter(|o| filter.to.is_none_or(|to| o.placed_at <= to))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        Ok(found)
    }

    async fn statistics(&self, user_id: i64) -> Result<OrderStatistics> {
        let orders = self.orders.read().unwrap();
        let mut stats = OrderStatistics::default();
        for order in orders.values().filter(|o| o.user_id == user_id) {
            match order.status {
                OrderStatus::Pending => stats.pending += 1,
                OrderStatus::Ongoing => stats.ongoing += 1,
                OrderStatus::Failed => stats.failed += 1,
                OrderStatus::Closed => stats.closed += 1,
                OrderStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Default)]
pub struct InMemoryPositionRepository {
    positions: RwLock<HashMap<(i64, String), Position>>,
}

impl InMemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn upsert(&self, position: &Position) -> Result<()> {
        let mut positions = self.positions.write().unwrap();
        positions.insert((position.user_id, position.symbol.clone()), position.clone());
        Ok(())
    }

    async fn find_open(&self, user_id: i64, symbol: &str) -> Result<Option<Position>> {
        let positions = self.positions.read().unwrap();
        Ok(positions
            .get(&(user_id, symbol.to_string()))
            .filter(|p| p.is_open())
            .cloned())
    }

    async fn open_positions(&self, user_id: i64) -> Result<Vec<Position>> {
        let positions = self.positions.read().unwrap();
        Ok(positions
            .values()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect())
    }

    async fn count_open(&self, user_id: i64) -> Result<usize> {
        Ok(self.open_positions(user_id).await?.len())
    }
}

#[derive(Default)]
pub struct InMemoryTrackingRepository {
    scopes: RwLock<HashMap<(i64, String), TrackingScope>>,
}

impl InMemoryTrackingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackingRepository for InMemoryTrackingRepository {
    async fn upsert(&self, scope: &TrackingScope) -> Result<()> {
        let mut scopes = self.scopes.write().unwrap();
        scopes.insert((scope.user_id, scope.symbol.clone()), scope.clone());
        Ok(())
    }

    async fn find(&self, user_id: i64, symbol: &str) -> Result<Option<TrackingScope>> {
        let scopes = self.scopes.read().unwrap();
        Ok(scopes.get(&(user_id, symbol.to_string())).cloned())
    }

    async fn active_scopes(&self, user_id: i64) -> Result<Vec<TrackingScope>> {
        let scopes = self.scopes.read().unwrap();
        Ok(scopes
            .values()
            .filter(|s| {
                s.user_id == user_id
                    && s.tracking_status == crate::domain::types::TrackingStatus::Active
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<TaskName, TaskSchedule>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn all(&self) -> Result<Vec<TaskSchedule>> {
        let schedules = self.schedules.read().unwrap();
        Ok(schedules.values().cloned().collect())
    }

    async fn find(&self, task: TaskName) -> Result<Option<TaskSchedule>> {
        let schedules = self.schedules.read().unwrap();
        Ok(schedules.get(&task).cloned())
    }

    async fn upsert(&self, schedule: &TaskSchedule) -> Result<()> {
        let mut schedules = self.schedules.write().unwrap();
        schedules.insert(schedule.task, schedule.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryServiceStatusRepository {
    statuses: RwLock<HashMap<(i64, TaskName), ServiceStatus>>,
}

impl InMemoryServiceStatusRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceStatusRepository for InMemoryServiceStatusRepository {
    async fn upsert(&self, status: &ServiceStatus) -> Result<()> {
        let mut statuses = self.statuses.write().unwrap();
        statuses.insert((status.user_id, status.task), status.clone());
        Ok(())
    }

    async fn find(&self, user_id: i64, task: TaskName) -> Result<Option<ServiceStatus>> {
        let statuses = self.statuses.read().unwrap();
        Ok(statuses.get(&(user_id, task)).cloned())
    }

    async fn for_user(&self, user_id: i64) -> Result<Vec<ServiceStatus>> {
        let statuses = self.statuses.read().unwrap();
        Ok(statuses
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}
