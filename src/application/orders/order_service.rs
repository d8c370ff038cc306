use super::state_machine::OrderLifecycleService;
use crate::application::validation::{PlacementIntent, ValidationService, ValidationVerdict};
use crate::domain::errors::BrokerError;
use crate::domain::ports::{BrokerAdapter, EventKind, OrderRequest};
use crate::domain::repositories::OrderRepository;
use crate::domain::types::{
    Order, OrderSide, OrderStatus, OrderType, Position, Recommendation, Variety, Verdict,
};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Order placement and the control-surface order operations.
///
/// Placement is idempotent by `local_id`: re-invoking with an id that is
/// already persisted returns the stored row without a second broker call.
pub struct OrderService {
    broker: Arc<dyn BrokerAdapter>,
    orders: Arc<dyn OrderRepository>,
    lifecycle: Arc<OrderLifecycleService>,
    validation: Arc<ValidationService>,
    notifier: Arc<RateLimitedNotifier>,
    tick_size: Decimal,
    capital_per_trade: Decimal,
}

impl OrderService {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        orders: Arc<dyn OrderRepository>,
        lifecycle: Arc<OrderLifecycleService>,
        validation: Arc<ValidationService>,
        notifier: Arc<RateLimitedNotifier>,
        tick_size: Decimal,
        capital_per_trade: Decimal,
    ) -> Self {
        Self {
            broker,
            orders,
            lifecycle,
            validation,
            notifier,
            tick_size,
            capital_per_trade,
        }
    }

    /// Snap a price to the exchange tick size.
    pub fn snap_to_tick(&self, price: Decimal) -> Decimal {
        snap_to_tick(price, self.tick_size)
    }

    /// Place a buy for a recommendation, AMO by default (the buy task runs
    /// after market close). Returns None when the verdict or a pre-trade
    /// gate filters the recommendation out without creating an order row.
    pub async fn place_buy_from_recommendation(
        &self,
        user_id: i64,
        rec: &Recommendation,
        variety: Variety,
        reference_price: Decimal,
    ) -> Result<Option<Order>> {
        if !matches!(rec.verdict, Verdict::Buy | Verdict::StrongBuy) {
            return Ok(None);
        }
        if reference_price <= Decimal::ZERO {
            warn!("OrderService: No valid reference price for {}", rec.symbol);
            return Ok(None);
        }

        let quantity = match rec.suggested_qty {
            Some(q) if q > Decimal::ZERO => q,
            _ => {
                let capital = rec.suggested_capital.unwrap_or(self.capital_per_trade);
                (capital / reference_price).floor()
            }
        };
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        let price = self.snap_to_tick(rec.entry_price_hint.unwrap_or(reference_price));

        let intent = PlacementIntent {
            user_id,
            symbol: rec.symbol.clone(),
            ticker: rec.ticker.clone(),
            side: OrderSide::Buy,
            quantity,
            price,
            is_retry: false,
        };

        let local_id = Uuid::new_v4().to_string();
        let mut order = new_order(user_id, &local_id, rec, OrderSide::Buy, variety, quantity, price);

        match self.validation.validate_order_placement(&intent).await? {
            ValidationVerdict::Ok { quantity: approved } => {
                order.quantity = approved;
                order.original_quantity = Some(approved);
                self.lifecycle.create_pending(&order).await?;
                let placed = self.dispatch(order).await?;
                Ok(Some(placed))
            }
            ValidationVerdict::Rejected { reason, detail } => {
                // The row is still created so the retry queue can pick the
                // failure up once conditions change
                self.lifecycle.create_pending(&order).await?;
                let failed = self
                    .lifecycle
                    .record_failure(
                        &order,
                        &format!("{}: {}", reason.reason_text(), detail),
                        Utc::now(),
                    )
                    .await?;
                Ok(Some(failed))
            }
        }
    }

    /// Limit sell at the computed intraday target. One active sell per
    /// symbol; an existing pending sell makes this a no-op.
    pub async fn place_sell_for_position(
        &self,
        position: &Position,
        target_price: Decimal,
    ) -> Result<Option<Order>> {
        if self
            .orders
            .find_pending_for_symbol(position.user_id, &position.symbol, OrderSide::Sell)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let price = self.snap_to_tick(target_price);
        let local_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let order = Order {
            user_id: position.user_id,
            local_id: local_id.clone(),
            broker_order_id: None,
            symbol: position.symbol.clone(),
            ticker: position.symbol.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: position.quantity,
            price: Some(price),
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: Some(price),
            original_quantity: Some(position.quantity),
            is_manual: false,
            cancel_requested: false,
            source_order_id: None,
            placed_at: now,
            updated_at: now,
        };

        self.lifecycle.create_pending(&order).await?;
        let placed = self.dispatch(order).await?;
        Ok(Some(placed))
    }

    /// Re-place a failed order with the broker, bumping the retry counter
    /// on success. Used by the premarket retry queue and the control
    /// surface.
    pub async fn place_retry(&self, order: &Order, quantity: Decimal) -> Result<Order> {
        if order.status != OrderStatus::Failed {
            bail!("Order {} is not in failed, cannot retry", order.local_id);
        }

        let request = OrderRequest {
            symbol: order.symbol.clone(),
            ticker: order.ticker.clone(),
            side: order.side,
            order_type: order.order_type,
            variety: Variety::Regular,
            quantity,
            price: order.price,
            tag: order.local_id.clone(),
        };

        match self.broker.place_order(&request).await {
            Ok(receipt) => {
                let updated = self
                    .lifecycle
                    .mark_retry_dispatched(
                        order,
                        receipt.broker_order_id,
                        Some(quantity),
                        Utc::now(),
                    )
                    .await?;
                self.notifier
                    .notify(
                        EventKind::OrderPlaced,
                        order.user_id,
                        format!(
                            "Retry #{} placed: {} {} x {}",
                            updated.retry_count, updated.side, updated.symbol, quantity
                        ),
                    )
                    .await;
                Ok(updated)
            }
            Err(BrokerError::Rejected { reason }) => {
                self.lifecycle.record_failure(order, &reason, Utc::now()).await
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "OrderService: Transient error re-placing {}: {}",
                    order.local_id, e
                );
                self.lifecycle.record_retry_attempt(order, Utc::now()).await
            }
            Err(e) => Err(e).context("Retry placement failed"),
        }
    }

    /// Control surface: DELETE /orders/{id}.
    pub async fn user_drop(&self, user_id: i64, local_id: &str) -> Result<Order> {
        let mut order = self
            .orders
            .find(user_id, local_id)
            .await?
            .with_context(|| format!("Order {} not found", local_id))?;

        if order.status.is_terminal() {
            return Ok(order);
        }

        // Flag the cancel request before the broker call so the monitor
        // cannot mistake this for manual activity
        if order.status == OrderStatus::Pending
            && let Some(broker_id) = order.broker_order_id.clone()
        {
            order.cancel_requested = true;
            order.updated_at = Utc::now();
            self.orders.update(&order).await?;

            if let Err(e) = self.broker.cancel_order(&broker_id).await {
                warn!("OrderService: Broker cancel for {} failed: {}", broker_id, e);
            }
        }

        self.lifecycle
            .record_cancellation(&order, "user drop", Utc::now())
            .await
    }

    /// Control surface: POST /orders/{id}/retry.
    pub async fn user_retry(&self, user_id: i64, local_id: &str) -> Result<Order> {
        let order = self
            .orders
            .find(user_id, local_id)
            .await?
            .with_context(|| format!("Order {} not found", local_id))?;

        if order.status != OrderStatus::Failed {
            bail!("Order {} is in {}, only failed orders can be retried", local_id, order.status);
        }

        self.place_retry(&order, order.quantity).await
    }

    async fn dispatch(&self, order: Order) -> Result<Order> {
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            ticker: order.ticker.clone(),
            side: order.side,
            order_type: order.order_type,
            variety: order.variety,
            quantity: order.quantity,
            price: order.price,
            tag: order.local_id.clone(),
        };

        match self.broker.place_order(&request).await {
            Ok(receipt) => {
                let mut placed = order.clone();
                placed.broker_order_id = receipt.broker_order_id;
                placed.updated_at = Utc::now();
                self.orders.update(&placed).await?;

                info!(
                    "OrderService: Placed {} {} x {} ({})",
                    placed.side, placed.symbol, placed.quantity, placed.local_id
                );
                self.notifier
                    .notify(
                        EventKind::OrderPlaced,
                        placed.user_id,
                        format!(
                            "{} {} x {} placed{}",
                            placed.side,
                            placed.symbol,
                            placed.quantity,
                            placed
                                .price
                                .map(|p| format!(" @ {}", p))
                                .unwrap_or_default()
                        ),
                    )
                    .await;
                Ok(placed)
            }
            Err(BrokerError::Rejected { reason }) => {
                self.lifecycle.record_failure(&order, &reason, Utc::now()).await
            }
            Err(e) if e.is_transient() => {
                self.lifecycle
                    .record_failure(&order, &format!("network error: {}", e), Utc::now())
                    .await
            }
            Err(e) => Err(e).context("Order placement failed"),
        }
    }
}

/// Round to the nearest exchange tick (half away from zero).
pub fn snap_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

fn new_order(
    user_id: i64,
    local_id: &str,
    rec: &Recommendation,
    side: OrderSide,
    variety: Variety,
    quantity: Decimal,
    price: Decimal,
) -> Order {
    let now = Utc::now();
    Order {
        user_id,
        local_id: local_id.to_string(),
        broker_order_id: None,
        symbol: rec.symbol.clone(),
        ticker: rec.ticker.clone(),
        side,
        order_type: OrderType::Limit,
        variety,
        quantity,
        price: Some(price),
        status: OrderStatus::Pending,
        reason: None,
        retry_count: 0,
        first_failed_at: None,
        last_retry_attempt: None,
        last_status_check: None,
        execution_price: None,
        execution_qty: None,
        execution_time: None,
        original_price: Some(price),
        original_quantity: Some(quantity),
        is_manual: false,
        cancel_requested: false,
        source_order_id: None,
        placed_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tick_snapping() {
        assert_eq!(snap_to_tick(dec!(2500.07), dec!(0.05)), dec!(2500.05));
        assert_eq!(snap_to_tick(dec!(2500.08), dec!(0.05)), dec!(2500.10));
        assert_eq!(snap_to_tick(dec!(2500.00), dec!(0.05)), dec!(2500.00));
        assert_eq!(snap_to_tick(dec!(99.996), dec!(0.01)), dec!(100.00));
        // Degenerate tick leaves the price untouched
        assert_eq!(snap_to_tick(dec!(123.456), dec!(0)), dec!(123.456));
    }
}
