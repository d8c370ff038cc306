use crate::domain::order_lifecycle::{FailureClass, classify_failure};
use crate::domain::ports::EventKind;
use crate::domain::repositories::{OrderRepository, PositionRepository, TrackingRepository};
use crate::domain::types::{
    Order, OrderSide, OrderStatus, Position, TrackingScope, TrackingStatus,
};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Applies order state transitions and their side effects (positions,
/// tracking scope, notifications) in one place.
///
/// Every operation is idempotent under its inputs: re-applying the same
/// transition is a no-op, and terminal rows are never touched again.
pub struct OrderLifecycleService {
    orders: Arc<dyn OrderRepository>,
    positions: Arc<dyn PositionRepository>,
    tracking: Arc<dyn TrackingRepository>,
    notifier: Arc<RateLimitedNotifier>,
}

impl OrderLifecycleService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        positions: Arc<dyn PositionRepository>,
        tracking: Arc<dyn TrackingRepository>,
        notifier: Arc<RateLimitedNotifier>,
    ) -> Self {
        Self {
            orders,
            positions,
            tracking,
            notifier,
        }
    }

    /// Persist a freshly placed order. Re-inserting the same
    /// `(user_id, local_id)` is absorbed by the repository.
    pub async fn create_pending(&self, order: &Order) -> Result<()> {
        self.orders.insert(order).await
    }

    /// Broker reported an execution. Buys open (or extend) the position
    /// and move to `ongoing`; sells reduce it and close the order once the
    /// position is flat.
    pub async fn record_execution(
        &self,
        order: &Order,
        qty: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        // Idempotence: the same execution applied twice is a no-op.
        if order.status.is_terminal()
            || (order.status == OrderStatus::Ongoing && order.execution_qty == Some(qty))
        {
            return Ok(order.clone());
        }

        let mut updated = order.clone();
        updated.execution_qty = Some(qty);
        updated.execution_price = Some(price);
        updated.execution_time = Some(at);
        updated.last_status_check = Some(at);
        updated.updated_at = at;

        match order.side {
            OrderSide::Buy => {
                updated.status = OrderStatus::Ongoing;
                self.orders.update(&updated).await?;
                self.open_or_extend_position(order, qty, price, at).await?;
                self.extend_tracking(order, qty).await?;
            }
            OrderSide::Sell => {
                let closes_position = self.reduce_position(order, qty, at).await?;
                updated.status = if closes_position {
                    OrderStatus::Closed
                } else {
                    OrderStatus::Ongoing
                };
                self.orders.update(&updated).await?;
                self.reduce_tracking(order, qty).await?;
            }
        }

        info!(
            "Lifecycle: Order {} executed {} x {} @ {}",
            updated.local_id, updated.symbol, qty, price
        );
        self.notifier
            .notify(
                EventKind::OrderExecuted,
                order.user_id,
                format!("{} {} x {} executed @ {}", order.side, order.symbol, qty, price),
            )
            .await;

        Ok(updated)
    }

    /// Partial fill: order stays `pending`, executed quantity is tracked.
    pub async fn record_partial_fill(
        &self,
        order: &Order,
        filled_qty: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        if order.status != OrderStatus::Pending || order.execution_qty == Some(filled_qty) {
            return Ok(order.clone());
        }
        let mut updated = order.clone();
        updated.execution_qty = Some(filled_qty);
        updated.last_status_check = Some(at);
        updated.updated_at = at;
        self.orders.update(&updated).await?;
        Ok(updated)
    }

    /// Broker rejection or local placement error. Transient failures land
    /// in `failed` (retriable until expiry); permanent ones are cancelled
    /// in the same write.
    pub async fn record_failure(
        &self,
        order: &Order,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        if order.status.is_terminal() {
            return Ok(order.clone());
        }
        if order.status == OrderStatus::Failed && order.reason.as_deref() == Some(reason) {
            return Ok(order.clone());
        }

        let mut updated = order.clone();
        updated.reason = Some(reason.to_string());
        updated.last_status_check = Some(at);
        updated.updated_at = at;
        if updated.first_failed_at.is_none() {
            updated.first_failed_at = Some(at);
        }

        match classify_failure(reason) {
            FailureClass::Transient => {
                updated.status = OrderStatus::Failed;
                self.orders.update(&updated).await?;
                warn!(
                    "Lifecycle: Order {} failed (retriable): {}",
                    updated.local_id, reason
                );
                self.notifier
                    .notify(
                        EventKind::OrderRejected,
                        order.user_id,
                        format!("{} {} failed: {}", order.side, order.symbol, reason),
                    )
                    .await;
            }
            FailureClass::Permanent => {
                updated.status = OrderStatus::Cancelled;
                self.orders.update(&updated).await?;
                warn!(
                    "Lifecycle: Order {} permanently rejected: {}",
                    updated.local_id, reason
                );
                self.notifier
                    .notify(
                        EventKind::OrderCancelled,
                        order.user_id,
                        format!(
                            "{} {} cancelled (permanent rejection): {}",
                            order.side, order.symbol, reason
                        ),
                    )
                    .await;
            }
        }

        Ok(updated)
    }

    /// Terminal withdrawal: user drop, system expiry, or broker cancel.
    pub async fn record_cancellation(
        &self,
        order: &Order,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        if order.status == OrderStatus::Cancelled {
            return Ok(order.clone());
        }
        if order.status.is_terminal() {
            return Ok(order.clone());
        }

        let mut updated = order.clone();
        updated.status = OrderStatus::Cancelled;
        updated.reason = Some(reason.to_string());
        updated.last_status_check = Some(at);
        updated.updated_at = at;
        self.orders.update(&updated).await?;

        info!("Lifecycle: Order {} cancelled: {}", updated.local_id, reason);
        self.notifier
            .notify(
                EventKind::OrderCancelled,
                order.user_id,
                format!("{} {} cancelled: {}", order.side, order.symbol, reason),
            )
            .await;

        Ok(updated)
    }

    /// Re-dispatch of a failed order: the row returns to `pending` with a
    /// bumped retry count. The new broker order id is set by the caller
    /// once placement succeeds.
    pub async fn mark_retry_dispatched(
        &self,
        order: &Order,
        broker_order_id: Option<String>,
        new_quantity: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        if order.status != OrderStatus::Failed {
            return Ok(order.clone());
        }

        let mut updated = order.clone();
        updated.status = OrderStatus::Pending;
        updated.retry_count = order.retry_count + 1;
        updated.last_retry_attempt = Some(at);
        updated.broker_order_id = broker_order_id;
        if let Some(qty) = new_quantity {
            updated.quantity = qty;
            updated.original_quantity = Some(qty);
        }
        updated.updated_at = at;
        self.orders.update(&updated).await?;

        info!(
            "Lifecycle: Order {} re-dispatched (retry #{})",
            updated.local_id, updated.retry_count
        );
        Ok(updated)
    }

    /// Balance still short at retry time: stay `failed`, count the attempt.
    pub async fn record_retry_attempt(&self, order: &Order, at: DateTime<Utc>) -> Result<Order> {
        if order.status != OrderStatus::Failed {
            return Ok(order.clone());
        }
        let mut updated = order.clone();
        updated.retry_count = order.retry_count + 1;
        updated.last_retry_attempt = Some(at);
        updated.updated_at = at;
        self.orders.update(&updated).await?;
        Ok(updated)
    }

    /// Touch `last_status_check` without a status change.
    pub async fn mark_checked(&self, order: &Order, at: DateTime<Utc>) -> Result<()> {
        let mut updated = order.clone();
        updated.last_status_check = Some(at);
        updated.updated_at = at;
        self.orders.update(&updated).await
    }

    async fn open_or_extend_position(
        &self,
        order: &Order,
        qty: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        match self.positions.find_open(order.user_id, &order.symbol).await? {
            Some(mut pos) => {
                pos.absorb_fill(qty, price);
                self.positions.upsert(&pos).await?;
            }
            None => {
                self.positions
                    .upsert(&Position {
                        user_id: order.user_id,
                        symbol: order.symbol.clone(),
                        quantity: qty,
                        avg_price: price,
                        opened_at: at,
                        closed_at: None,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Returns true when the sell flattens the position.
    async fn reduce_position(
        &self,
        order: &Order,
        qty: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut pos) = self.positions.find_open(order.user_id, &order.symbol).await? else {
            warn!(
                "Lifecycle: Sell execution for {} with no open position",
                order.symbol
            );
            return Ok(true);
        };

        pos.quantity -= qty;
        if pos.quantity <= Decimal::ZERO {
            pos.quantity = Decimal::ZERO;
            pos.closed_at = Some(at);
            self.positions.upsert(&pos).await?;
            Ok(true)
        } else {
            self.positions.upsert(&pos).await?;
            Ok(false)
        }
    }

    async fn extend_tracking(&self, order: &Order, qty: Decimal) -> Result<()> {
        let mut scope = match self.tracking.find(order.user_id, &order.symbol).await? {
            Some(s) => s,
            None => TrackingScope {
                user_id: order.user_id,
                symbol: order.symbol.clone(),
                system_qty: Decimal::ZERO,
                pre_existing_qty: Decimal::ZERO,
                current_tracked_qty: Decimal::ZERO,
                tracking_status: TrackingStatus::Active,
                initial_order_id: Some(order.local_id.clone()),
                related_order_ids: Vec::new(),
                recommendation_source: None,
            },
        };

        scope.system_qty += qty;
        scope.current_tracked_qty += qty;
        scope.tracking_status = TrackingStatus::Active;
        if !scope.related_order_ids.contains(&order.local_id) {
            scope.related_order_ids.push(order.local_id.clone());
        }
        self.tracking.upsert(&scope).await
    }

    async fn reduce_tracking(&self, order: &Order, qty: Decimal) -> Result<()> {
        let Some(mut scope) = self.tracking.find(order.user_id, &order.symbol).await? else {
            return Ok(());
        };

        scope.current_tracked_qty = (scope.current_tracked_qty - qty).max(Decimal::ZERO);
        if !scope.related_order_ids.contains(&order.local_id) {
            scope.related_order_ids.push(order.local_id.clone());
        }
        if scope.current_tracked_qty == Decimal::ZERO {
            scope.tracking_status = TrackingStatus::Completed;
            self.notifier
                .notify(
                    EventKind::TrackingStopped,
                    order.user_id,
                    format!("Tracking completed for {}", order.symbol),
                )
                .await;
        }
        self.tracking.upsert(&scope).await
    }
}
