use super::order_service::OrderService;
use super::state_machine::OrderLifecycleService;
use crate::application::validation::{
    PlacementIntent, RejectReason, ValidationService, ValidationVerdict,
};
use crate::domain::market_calendar::MarketCalendar;
use crate::domain::ports::{BrokerAdapter, EventKind, OrderBookSnapshot};
use crate::domain::repositories::OrderRepository;
use crate::domain::types::{BrokerOrderState, Order, OrderSide, OrderStatus};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const EXPIRY_REASON: &str = "expired at next-trading-day market close";

#[derive(Debug, Default, Clone)]
pub struct RetryReport {
    pub examined: usize,
    pub expired: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub still_failed: usize,
}

/// Premarket re-dispatch of failed orders.
///
/// Eligibility is expiry (next-trading-day market close after
/// `first_failed_at`) plus the runtime filters; the retry count itself is
/// unbounded, expiry alone terminates retries.
pub struct RetryQueue {
    orders: Arc<dyn OrderRepository>,
    lifecycle: Arc<OrderLifecycleService>,
    order_service: Arc<OrderService>,
    validation: Arc<ValidationService>,
    broker: Arc<dyn BrokerAdapter>,
    calendar: MarketCalendar,
    notifier: Arc<RateLimitedNotifier>,
}

impl RetryQueue {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        lifecycle: Arc<OrderLifecycleService>,
        order_service: Arc<OrderService>,
        validation: Arc<ValidationService>,
        broker: Arc<dyn BrokerAdapter>,
        calendar: MarketCalendar,
        notifier: Arc<RateLimitedNotifier>,
    ) -> Self {
        Self {
            orders,
            lifecycle,
            order_service,
            validation,
            broker,
            calendar,
            notifier,
        }
    }

    pub fn expiry_of(&self, order: &Order) -> DateTime<Utc> {
        self.calendar
            .next_trading_day_close(order.first_failed_at.unwrap_or(order.placed_at))
    }

    pub async fn run_premarket(&self, user_id: i64, now: DateTime<Utc>) -> Result<RetryReport> {
        let failed = self.orders.find_by_status(user_id, OrderStatus::Failed).await?;
        let mut report = RetryReport {
            examined: failed.len(),
            ..Default::default()
        };
        if failed.is_empty() {
            return Ok(report);
        }

        // One order-book fetch for the whole pass (manual-order checks)
        let book = match self.broker.list_orders().await {
            Ok(b) => b,
            Err(e) if e.is_transient() => {
                warn!("RetryQueue: Order book fetch failed, pass abandoned: {}", e);
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        for order in failed {
            // Expired rows are cancelled before any further consideration
            if now > self.expiry_of(&order) {
                self.lifecycle
                    .record_cancellation(&order, EXPIRY_REASON, now)
                    .await?;
                report.expired += 1;
                continue;
            }

            if self.adopt_manual_order(user_id, &order, &book, now).await? {
                report.skipped += 1;
                continue;
            }

            let Some(reference_price) = self.reference_price(&order) else {
                info!("RetryQueue: No valid reference price for {}, skipped", order.symbol);
                report.skipped += 1;
                continue;
            };

            let intent = PlacementIntent {
                user_id,
                symbol: order.symbol.clone(),
                ticker: order.ticker.clone(),
                side: order.side,
                quantity: order.quantity,
                price: reference_price,
                is_retry: true,
            };

            match self.validation.validate_order_placement(&intent).await? {
                ValidationVerdict::Ok { quantity } => {
                    self.order_service.place_retry(&order, quantity).await?;
                    report.dispatched += 1;
                }
                ValidationVerdict::Rejected { reason, detail } => match reason {
                    RejectReason::PortfolioFull => {
                        info!("RetryQueue: Portfolio full, remaining retries deferred");
                        report.skipped += 1;
                        break;
                    }
                    RejectReason::AlreadyHeld => {
                        self.lifecycle
                            .record_cancellation(&order, "already in holdings", now)
                            .await?;
                        report.cancelled += 1;
                    }
                    RejectReason::InsufficientBalance => {
                        // Still short of cash: count the attempt, stay failed
                        self.lifecycle.record_retry_attempt(&order, now).await?;
                        report.still_failed += 1;
                    }
                    RejectReason::IndicatorsUnavailable
                    | RejectReason::VolumeRatioExceeded
                    | RejectReason::DuplicateOrder => {
                        info!(
                            "RetryQueue: {} skipped this cycle: {}",
                            order.symbol, detail
                        );
                        report.skipped += 1;
                    }
                    RejectReason::InvalidSymbol => {
                        self.lifecycle
                            .record_cancellation(
                                &order,
                                &format!("invalid symbol: {}", detail),
                                now,
                            )
                            .await?;
                        report.cancelled += 1;
                    }
                },
            }
        }

        if report.dispatched + report.expired + report.cancelled > 0 {
            self.notifier
                .notify(
                    EventKind::RetryQueueUpdated,
                    user_id,
                    format!(
                        "Retry pass: {} dispatched, {} expired, {} cancelled, {} skipped",
                        report.dispatched, report.expired, report.cancelled, report.skipped
                    ),
                )
                .await;
        }

        Ok(report)
    }

    /// A manual buy already sitting in the broker book for this symbol is
    /// absorbed as a tracked `pending` row; the failed order is left to
    /// expire rather than doubling the exposure.
    async fn adopt_manual_order(
        &self,
        user_id: i64,
        order: &Order,
        book: &OrderBookSnapshot,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let manual = book.entries.iter().find(|e| {
            e.symbol == order.symbol
                && e.side == OrderSide::Buy
                && !matches!(
                    e.state,
                    BrokerOrderState::Rejected { .. } | BrokerOrderState::Cancelled
                )
        });
        let Some(entry) = manual else {
            return Ok(false);
        };

        if self
            .orders
            .find_by_broker_id(user_id, &entry.broker_order_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        info!(
            "RetryQueue: Manual order {} found for {}, linking instead of retrying",
            entry.broker_order_id, order.symbol
        );
        let adopted = Order {
            user_id,
            local_id: Uuid::new_v4().to_string(),
            broker_order_id: Some(entry.broker_order_id.clone()),
            symbol: entry.symbol.clone(),
            ticker: order.ticker.clone(),
            side: entry.side,
            order_type: order.order_type,
            variety: crate::domain::types::Variety::Regular,
            quantity: entry.quantity,
            price: entry.price,
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: Some(now),
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: entry.price,
            original_quantity: Some(entry.quantity),
            is_manual: true,
            cancel_requested: false,
            source_order_id: Some(order.local_id.clone()),
            placed_at: now,
            updated_at: now,
        };
        self.orders.insert(&adopted).await?;

        self.notifier
            .notify(
                EventKind::ManualActivityDetected,
                user_id,
                format!("Manual buy order adopted for {}", order.symbol),
            )
            .await;
        Ok(true)
    }

    fn reference_price(&self, order: &Order) -> Option<Decimal> {
        order
            .price
            .filter(|p| *p > Decimal::ZERO)
            .or(order.original_price.filter(|p| *p > Decimal::ZERO))
    }
}
