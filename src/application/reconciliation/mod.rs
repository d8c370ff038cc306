//! Detects and absorbs out-of-band broker activity: manual trades,
//! externally cancelled or modified orders, and holdings that pre-date
//! tracking. Cycles are best-effort and idempotent; partial failures warn
//! and retry next cycle.

use crate::application::orders::OrderLifecycleService;
use crate::domain::ports::{EventKind, HoldingsSnapshot, OrderBookSnapshot};
use crate::domain::repositories::{OrderRepository, PositionRepository, TrackingRepository};
use crate::domain::types::{BrokerOrderState, OrderStatus, TrackingScope, TrackingStatus};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};

const PRICE_TOLERANCE: Decimal = dec!(0.01);

#[derive(Debug, Default, Clone)]
pub struct ReconReport {
    pub manual_buys: usize,
    pub manual_sells: usize,
    pub external_cancels: usize,
    pub external_modifications: usize,
    pub pre_existing_recorded: usize,
}

pub struct ReconciliationEngine {
    user_id: i64,
    tracking: Arc<dyn TrackingRepository>,
    orders: Arc<dyn OrderRepository>,
    positions: Arc<dyn PositionRepository>,
    lifecycle: Arc<OrderLifecycleService>,
    notifier: Arc<RateLimitedNotifier>,
}

impl ReconciliationEngine {
    pub fn new(
        user_id: i64,
        tracking: Arc<dyn TrackingRepository>,
        orders: Arc<dyn OrderRepository>,
        positions: Arc<dyn PositionRepository>,
        lifecycle: Arc<OrderLifecycleService>,
        notifier: Arc<RateLimitedNotifier>,
    ) -> Self {
        Self {
            user_id,
            tracking,
            orders,
            positions,
            lifecycle,
            notifier,
        }
    }

    /// One reconciliation cycle over snapshots that were fetched by the
    /// caller (the monitor's tick, or an ad-hoc run). Only tracked symbols
    /// are mutated; everything else is read-only.
    pub async fn reconcile(
        &self,
        holdings: &HoldingsSnapshot,
        book: &OrderBookSnapshot,
    ) -> Result<ReconReport> {
        let mut report = ReconReport::default();

        self.reconcile_holdings(holdings, &mut report).await?;
        self.record_pre_existing(holdings, &mut report).await?;
        self.reconcile_book(book, &mut report).await?;

        Ok(report)
    }

    async fn reconcile_holdings(
        &self,
        holdings: &HoldingsSnapshot,
        report: &mut ReconReport,
    ) -> Result<()> {
        for mut scope in self.tracking.active_scopes(self.user_id).await? {
            let broker_qty = holdings.quantity_of(&scope.symbol);
            let expected = scope.current_tracked_qty + scope.pre_existing_qty;

            if broker_qty > expected {
                let delta = broker_qty - expected;
                scope.current_tracked_qty += delta;
                if let Err(e) = self.tracking.upsert(&scope).await {
                    warn!("Reconciliation: Failed to absorb manual buy for {}: {}", scope.symbol, e);
                    continue;
                }
                self.sync_position_qty(&scope).await?;

                info!(
                    "Reconciliation: Manual buy of {} detected for {} (delta +{})",
                    scope.symbol, self.user_id, delta
                );
                self.notifier
                    .notify(
                        EventKind::ManualActivityDetected,
                        self.user_id,
                        format!("manual buy: {} delta +{}", scope.symbol, delta),
                    )
                    .await;
                report.manual_buys += 1;
            } else if broker_qty < expected {
                let delta = expected - broker_qty;
                scope.current_tracked_qty = (scope.current_tracked_qty - delta).max(Decimal::ZERO);
                let completed = scope.current_tracked_qty == Decimal::ZERO;
                if completed {
                    scope.tracking_status = TrackingStatus::Completed;
                }
                if let Err(e) = self.tracking.upsert(&scope).await {
                    warn!("Reconciliation: Failed to absorb manual sell for {}: {}", scope.symbol, e);
                    continue;
                }
                self.sync_position_qty(&scope).await?;

                info!(
                    "Reconciliation: Manual sell of {} detected for {} (delta -{})",
                    scope.symbol, self.user_id, delta
                );
                self.notifier
                    .notify(
                        EventKind::ManualActivityDetected,
                        self.user_id,
                        format!("manual sell: {} delta -{}", scope.symbol, delta),
                    )
                    .await;
                if completed {
                    self.notifier
                        .notify(
                            EventKind::TrackingStopped,
                            self.user_id,
                            format!("Tracking completed for {} (manual exit)", scope.symbol),
                        )
                        .await;
                }
                report.manual_sells += 1;
            }
        }
        Ok(())
    }

    /// First observation of an untracked holding records its quantity as
    /// pre-existing, so it is never attributed to the system.
    async fn record_pre_existing(
        &self,
        holdings: &HoldingsSnapshot,
        report: &mut ReconReport,
    ) -> Result<()> {
        for holding in &holdings.holdings {
            if holding.quantity <= Decimal::ZERO {
                continue;
            }
            if self.tracking.find(self.user_id, &holding.symbol).await?.is_some() {
                continue;
            }

            let scope = TrackingScope {
                user_id: self.user_id,
                symbol: holding.symbol.clone(),
                system_qty: Decimal::ZERO,
                pre_existing_qty: holding.quantity,
                current_tracked_qty: Decimal::ZERO,
                // Nothing system-originated to track yet
                tracking_status: TrackingStatus::Completed,
                initial_order_id: None,
                related_order_ids: Vec::new(),
                recommendation_source: None,
            };
            self.tracking.upsert(&scope).await?;
            info!(
                "Reconciliation: Recorded pre-existing holding {} x {}",
                holding.symbol, holding.quantity
            );
            report.pre_existing_recorded += 1;
        }
        Ok(())
    }

    async fn reconcile_book(
        &self,
        book: &OrderBookSnapshot,
        report: &mut ReconReport,
    ) -> Result<()> {
        for entry in &book.entries {
            let Some(order) = self
                .orders
                .find_by_broker_id(self.user_id, &entry.broker_order_id)
                .await?
            else {
                continue;
            };

            match &entry.state {
                BrokerOrderState::Cancelled => {
                    if order.status == OrderStatus::Pending && !order.cancel_requested {
                        self.lifecycle
                            .record_cancellation(&order, "manual cancellation", Utc::now())
                            .await?;
                        self.notifier
                            .notify(
                                EventKind::ManualActivityDetected,
                                self.user_id,
                                format!(
                                    "Order {} for {} cancelled outside the system",
                                    entry.broker_order_id, order.symbol
                                ),
                            )
                            .await;
                        report.external_cancels += 1;
                    }
                }
                BrokerOrderState::Rejected { .. } | BrokerOrderState::Executed { .. } => {}
                _ => {
                    if order.status != OrderStatus::Pending {
                        continue;
                    }
                    let price_moved = match (entry.price, order.original_price) {
                        (Some(book_price), Some(original)) => {
                            (book_price - original).abs() > PRICE_TOLERANCE
                        }
                        _ => false,
                    };
                    let qty_moved = order
                        .original_quantity
                        .is_some_and(|original| entry.quantity != original);

                    if price_moved || qty_moved {
                        let mut updated = order.clone();
                        updated.price = entry.price;
                        updated.quantity = entry.quantity;
                        updated.original_price = entry.price;
                        updated.original_quantity = Some(entry.quantity);
                        updated.is_manual = true;
                        updated.updated_at = Utc::now();
                        self.orders.update(&updated).await?;

                        info!(
                            "Reconciliation: Order {} for {} modified at the broker",
                            entry.broker_order_id, order.symbol
                        );
                        self.notifier
                            .notify(
                                EventKind::ManualActivityDetected,
                                self.user_id,
                                format!(
                                    "Order {} for {} modified outside the system",
                                    entry.broker_order_id, order.symbol
                                ),
                            )
                            .await;
                        report.external_modifications += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Keep the Position row aligned with the tracked quantity after
    /// manual activity.
    async fn sync_position_qty(&self, scope: &TrackingScope) -> Result<()> {
        let Some(mut pos) = self
            .positions
            .find_open(self.user_id, &scope.symbol)
            .await?
        else {
            return Ok(());
        };

        pos.quantity = scope.current_tracked_qty;
        if pos.quantity == Decimal::ZERO {
            pos.closed_at = Some(Utc::now());
        }
        self.positions.upsert(&pos).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Holding, OrderBookEntry};
    use crate::domain::types::{Order, OrderSide, OrderType, Position, Variety};
    use crate::infrastructure::in_memory::{
        InMemoryOrderRepository, InMemoryPositionRepository, InMemoryTrackingRepository,
    };
    use crate::infrastructure::mock::RecordingTransport;

    struct Fixture {
        engine: ReconciliationEngine,
        tracking: Arc<InMemoryTrackingRepository>,
        orders: Arc<InMemoryOrderRepository>,
        positions: Arc<InMemoryPositionRepository>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let orders = Arc::new(InMemoryOrderRepository::new());
        let positions = Arc::new(InMemoryPositionRepository::new());
        let tracking = Arc::new(InMemoryTrackingRepository::new());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(RateLimitedNotifier::new(transport.clone(), 100, 1000));
        let lifecycle = Arc::new(OrderLifecycleService::new(
            orders.clone(),
            positions.clone(),
            tracking.clone(),
            notifier.clone(),
        ));
        let engine = ReconciliationEngine::new(
            1,
            tracking.clone(),
            orders.clone(),
            positions.clone(),
            lifecycle,
            notifier,
        );
        Fixture {
            engine,
            tracking,
            orders,
            positions,
            transport,
        }
    }

    fn holdings(entries: &[(&str, Decimal)]) -> HoldingsSnapshot {
        HoldingsSnapshot {
            holdings: entries
                .iter()
                .map(|(s, q)| Holding {
                    symbol: s.to_string(),
                    quantity: *q,
                    avg_price: dec!(2500),
                })
                .collect(),
            fetched_at: Utc::now(),
        }
    }

    fn empty_book() -> OrderBookSnapshot {
        OrderBookSnapshot {
            entries: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    async fn seed_tracked(f: &Fixture, symbol: &str, qty: Decimal) {
        f.tracking
            .upsert(&TrackingScope {
                user_id: 1,
                symbol: symbol.to_string(),
                system_qty: qty,
                pre_existing_qty: Decimal::ZERO,
                current_tracked_qty: qty,
                tracking_status: TrackingStatus::Active,
                initial_order_id: Some("o1".to_string()),
                related_order_ids: vec!["o1".to_string()],
                recommendation_source: None,
            })
            .await
            .unwrap();
        f.positions
            .upsert(&Position {
                user_id: 1,
                symbol: symbol.to_string(),
                quantity: qty,
                avg_price: dec!(2500),
                opened_at: Utc::now(),
                closed_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_sell_reduces_tracked_qty() {
        let f = fixture();
        seed_tracked(&f, "ACME", dec!(10)).await;

        // User sold 4 shares outside the system
        let report = f
            .engine
            .reconcile(&holdings(&[("ACME", dec!(6))]), &empty_book())
            .await
            .unwrap();

        assert_eq!(report.manual_sells, 1);
        let scope = f.tracking.find(1, "ACME").await.unwrap().unwrap();
        assert_eq!(scope.current_tracked_qty, dec!(6));
        assert_eq!(scope.tracking_status, TrackingStatus::Active);

        let pos = f.positions.find_open(1, "ACME").await.unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(6));

        let notes = f.transport.messages_of(EventKind::ManualActivityDetected);
        assert!(notes[0].contains("manual sell"));
        assert!(notes[0].contains("-4"));
    }

    #[tokio::test]
    async fn test_manual_sell_to_zero_completes_tracking() {
        let f = fixture();
        seed_tracked(&f, "ACME", dec!(10)).await;

        let report = f
            .engine
            .reconcile(&holdings(&[]), &empty_book())
            .await
            .unwrap();

        assert_eq!(report.manual_sells, 1);
        let scope = f.tracking.find(1, "ACME").await.unwrap().unwrap();
        assert_eq!(scope.tracking_status, TrackingStatus::Completed);
        assert!(f.positions.find_open(1, "ACME").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_buy_increases_tracked_qty() {
        let f = fixture();
        seed_tracked(&f, "ACME", dec!(10)).await;

        let report = f
            .engine
            .reconcile(&holdings(&[("ACME", dec!(15))]), &empty_book())
            .await
            .unwrap();

        assert_eq!(report.manual_buys, 1);
        let scope = f.tracking.find(1, "ACME").await.unwrap().unwrap();
        assert_eq!(scope.current_tracked_qty, dec!(15));
    }

    #[tokio::test]
    async fn test_pre_existing_holding_recorded_once() {
        let f = fixture();

        let report = f
            .engine
            .reconcile(&holdings(&[("LEGACY", dec!(50))]), &empty_book())
            .await
            .unwrap();
        assert_eq!(report.pre_existing_recorded, 1);

        let scope = f.tracking.find(1, "LEGACY").await.unwrap().unwrap();
        assert_eq!(scope.pre_existing_qty, dec!(50));
        assert_eq!(scope.system_qty, dec!(0));

        // Second cycle is a no-op
        let report = f
            .engine
            .reconcile(&holdings(&[("LEGACY", dec!(50))]), &empty_book())
            .await
            .unwrap();
        assert_eq!(report.pre_existing_recorded, 0);
    }

    #[tokio::test]
    async fn test_external_price_modification_detected() {
        let f = fixture();
        let now = Utc::now();
        let order = Order {
            user_id: 1,
            local_id: "o1".to_string(),
            broker_order_id: Some("B1".to_string()),
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: dec!(10),
            price: Some(dec!(2550)),
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: Some(dec!(2550)),
            original_quantity: Some(dec!(10)),
            is_manual: false,
            cancel_requested: false,
            source_order_id: None,
            placed_at: now,
            updated_at: now,
        };
        f.orders.insert(&order).await.unwrap();

        // User moved the limit price from 2550 to 2600 at the broker
        let book = OrderBookSnapshot {
            entries: vec![OrderBookEntry {
                broker_order_id: "B1".to_string(),
                symbol: "ACME".to_string(),
                side: OrderSide::Sell,
                quantity: dec!(10),
                price: Some(dec!(2600)),
                state: BrokerOrderState::Open,
                filled_qty: Decimal::ZERO,
                avg_fill_price: None,
                tag: Some("o1".to_string()),
                updated_at: Some(now),
            }],
            fetched_at: now,
        };

        let report = f.engine.reconcile(&holdings(&[]), &book).await.unwrap();
        assert_eq!(report.external_modifications, 1);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.price, Some(dec!(2600)));
        assert_eq!(stored.original_price, Some(dec!(2600)));
        assert!(stored.is_manual);
        // No cancel-and-replace happened
        assert_eq!(stored.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_price_within_tolerance_ignored() {
        let f = fixture();
        let now = Utc::now();
        let mut order_book = empty_book();
        order_book.entries.push(OrderBookEntry {
            broker_order_id: "B1".to_string(),
            symbol: "ACME".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(10),
            price: Some(dec!(2550.01)),
            state: BrokerOrderState::Open,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            tag: Some("o1".to_string()),
            updated_at: Some(now),
        });

        let order = Order {
            user_id: 1,
            local_id: "o1".to_string(),
            broker_order_id: Some("B1".to_string()),
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: dec!(10),
            price: Some(dec!(2550)),
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: Some(dec!(2550)),
            original_quantity: Some(dec!(10)),
            is_manual: false,
            cancel_requested: false,
            source_order_id: None,
            placed_at: now,
            updated_at: now,
        };
        f.orders.insert(&order).await.unwrap();

        let report = f.engine.reconcile(&holdings(&[]), &order_book).await.unwrap();
        assert_eq!(report.external_modifications, 0);
    }

    #[tokio::test]
    async fn test_externally_cancelled_order() {
        let f = fixture();
        let now = Utc::now();
        let order = Order {
            user_id: 1,
            local_id: "o1".to_string(),
            broker_order_id: Some("B1".to_string()),
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: dec!(10),
            price: Some(dec!(2550)),
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: Some(dec!(2550)),
            original_quantity: Some(dec!(10)),
            is_manual: false,
            cancel_requested: false,
            source_order_id: None,
            placed_at: now,
            updated_at: now,
        };
        f.orders.insert(&order).await.unwrap();

        let mut book = empty_book();
        book.entries.push(OrderBookEntry {
            broker_order_id: "B1".to_string(),
            symbol: "ACME".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(10),
            price: Some(dec!(2550)),
            state: BrokerOrderState::Cancelled,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            tag: Some("o1".to_string()),
            updated_at: Some(now),
        });

        let report = f.engine.reconcile(&holdings(&[]), &book).await.unwrap();
        assert_eq!(report.external_cancels, 1);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.reason.as_deref(), Some("manual cancellation"));
    }
}
