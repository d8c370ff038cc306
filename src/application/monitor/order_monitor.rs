use crate::application::orders::OrderLifecycleService;
use crate::domain::errors::BrokerError;
use crate::domain::ports::{BrokerAdapter, EventKind, OrderBookEntry, OrderBookSnapshot};
use crate::domain::repositories::OrderRepository;
use crate::domain::types::{BrokerOrderState, Order, OrderStatus, VerificationResult};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct TickReport {
    pub checked: usize,
    pub executed: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub partial: usize,
    /// Set when the tick was abandoned before any repository write.
    pub aborted: bool,
    /// The snapshot backing this tick, shared with reconciliation so no
    /// collaborator fetches the book twice in one tick.
    pub book: Option<Arc<OrderBookSnapshot>>,
}

/// Single control loop over the broker's order book.
///
/// One fetch per tick covers every tracked buy and sell order; the
/// resulting `VerificationResult`s are published to a shared map that is
/// read-only for the rest of the tick. No other collaborator polls the
/// broker for order status.
pub struct UnifiedOrderMonitor {
    user_id: i64,
    broker: Arc<dyn BrokerAdapter>,
    orders: Arc<dyn OrderRepository>,
    lifecycle: Arc<OrderLifecycleService>,
    notifier: Arc<RateLimitedNotifier>,
    verify_delay: Duration,
    verification: RwLock<Arc<HashMap<String, VerificationResult>>>,
}

impl UnifiedOrderMonitor {
    pub fn new(
        user_id: i64,
        broker: Arc<dyn BrokerAdapter>,
        orders: Arc<dyn OrderRepository>,
        lifecycle: Arc<OrderLifecycleService>,
        notifier: Arc<RateLimitedNotifier>,
        verify_delay: Duration,
    ) -> Self {
        Self {
            user_id,
            broker,
            orders,
            lifecycle,
            notifier,
            verify_delay,
            verification: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// The verification map of the last completed tick. Collaborators read
    /// this instead of calling the broker.
    pub async fn verification_map(&self) -> Arc<HashMap<String, VerificationResult>> {
        self.verification.read().await.clone()
    }

    /// One tick: fetch the order book once, reconcile every active order,
    /// publish the verification map.
    ///
    /// Transient fetch failures (including deadline overruns) abort the
    /// tick before any repository write; an expired session skips the tick
    /// after the adapter's single re-auth attempt failed.
    pub async fn monitor_all_orders(&self, tick_time: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let active = self.orders.find_active(self.user_id).await?;
        if active.is_empty() {
            return Ok(report);
        }

        let book = match self.broker.list_orders().await {
            Ok(b) => Arc::new(b),
            Err(e) if e.is_transient() => {
                warn!("OrderMonitor: Order book fetch failed, tick abandoned: {}", e);
                report.aborted = true;
                return Ok(report);
            }
            Err(BrokerError::SessionExpired) => {
                warn!("OrderMonitor: Session expired and re-auth failed, tick skipped");
                report.aborted = true;
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut results: HashMap<String, VerificationResult> = HashMap::new();

        for order in &active {
            let entry = self.match_entry(order, &book);
            let outcome = self.apply_entry(order, entry, tick_time).await;
            match outcome {
                Ok(result) => {
                    report.checked += 1;
                    match &result.state {
                        BrokerOrderState::Executed { .. } => report.executed += 1,
                        BrokerOrderState::Rejected { .. } => report.rejected += 1,
                        BrokerOrderState::Cancelled => report.cancelled += 1,
                        BrokerOrderState::PartiallyFilled { .. } => report.partial += 1,
                        _ => {}
                    }
                    results.insert(order.local_id.clone(), result);
                }
                Err(e) => {
                    // Quarantine: the row keeps its status, the tick goes on
                    warn!(
                        "OrderMonitor: Failed to process order {}: {}",
                        order.local_id, e
                    );
                }
            }
        }

        // Atomic publish after the write phase; readers only ever see a
        // complete map
        *self.verification.write().await = Arc::new(results);

        report.book = Some(book);
        Ok(report)
    }

    /// Blocking single poll shortly after a placement to catch immediate
    /// rejection. One bounded retry on a transient fetch error; never
    /// called from the scheduler's main loop.
    pub async fn verify_after_placement(&self, local_id: &str) -> Result<()> {
        tokio::time::sleep(self.verify_delay).await;

        let Some(order) = self.orders.find(self.user_id, local_id).await? else {
            return Ok(());
        };
        if order.status != OrderStatus::Pending {
            return Ok(());
        }

        let book = match self.broker.list_orders().await {
            Ok(b) => b,
            Err(e) if e.is_transient() => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                match self.broker.list_orders().await {
                    Ok(b) => b,
                    Err(e2) => {
                        warn!(
                            "OrderMonitor: Post-placement verify failed twice for {}: {} / {}",
                            local_id, e, e2
                        );
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                warn!("OrderMonitor: Post-placement verify failed for {}: {}", local_id, e);
                return Ok(());
            }
        };

        let entry = self.match_entry(&order, &book);
        if let Some(entry) = entry {
            self.apply_entry(&order, Some(entry), Utc::now()).await?;
        }
        Ok(())
    }

    fn match_entry<'a>(
        &self,
        order: &Order,
        book: &'a OrderBookSnapshot,
    ) -> Option<&'a OrderBookEntry> {
        if let Some(broker_id) = &order.broker_order_id
            && let Some(entry) = book.by_broker_id(broker_id)
        {
            return Some(entry);
        }
        // AMO placements may only get their broker id at session open;
        // fall back to the tag echo
        book.entries
            .iter()
            .find(|e| e.tag.as_deref() == Some(order.local_id.as_str()))
    }

    /// Map one broker state onto the lifecycle. At most one repository
    /// write per order per tick.
    async fn apply_entry(
        &self,
        order: &Order,
        entry: Option<&OrderBookEntry>,
        at: DateTime<Utc>,
    ) -> Result<VerificationResult> {
        let Some(entry) = entry else {
            // Not in the book (AMO queued overnight, or book lag):
            // just record the check
            self.lifecycle.mark_checked(order, at).await?;
            return Ok(VerificationResult {
                local_id: order.local_id.clone(),
                broker_order_id: order.broker_order_id.clone(),
                state: BrokerOrderState::Open,
                status_after: order.status,
                checked_at: at,
            });
        };

        let mut order = order.clone();
        if order.broker_order_id.is_none() {
            order.broker_order_id = Some(entry.broker_order_id.clone());
        }

        let updated = match &entry.state {
            BrokerOrderState::Executed { qty, price } => {
                self.lifecycle
                    .record_execution(&order, *qty, *price, at)
                    .await?
            }
            BrokerOrderState::PartiallyFilled { filled_qty } => {
                self.lifecycle
                    .record_partial_fill(&order, *filled_qty, at)
                    .await?
            }
            BrokerOrderState::Rejected { reason } => {
                self.lifecycle.record_failure(&order, reason, at).await?
            }
            BrokerOrderState::Cancelled => {
                if order.cancel_requested {
                    self.lifecycle
                        .record_cancellation(&order, "cancelled on request", at)
                        .await?
                } else {
                    // Nobody here asked for this cancel: manual activity
                    let updated = self
                        .lifecycle
                        .record_cancellation(&order, "manual cancellation", at)
                        .await?;
                    self.notifier
                        .notify(
                            EventKind::ManualActivityDetected,
                            self.user_id,
                            format!(
                                "Order {} for {} was cancelled outside the system",
                                entry.broker_order_id, order.symbol
                            ),
                        )
                        .await;
                    updated
                }
            }
            BrokerOrderState::Open
            | BrokerOrderState::TriggerPending
            | BrokerOrderState::AmoReceived => {
                self.lifecycle.mark_checked(&order, at).await?;
                order.clone()
            }
        };

        if updated.status != order.status {
            info!(
                "OrderMonitor: {} {} -> {}",
                updated.local_id, order.status, updated.status
            );
        }

        Ok(VerificationResult {
            local_id: updated.local_id.clone(),
            broker_order_id: updated.broker_order_id.clone(),
            state: entry.state.clone(),
            status_after: updated.status,
            checked_at: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderSide, OrderType, Variety};
    use crate::infrastructure::in_memory::{
        InMemoryOrderRepository, InMemoryPositionRepository, InMemoryTrackingRepository,
    };
    use crate::infrastructure::mock::{MockBroker, RecordingTransport};
    use rust_decimal_macros::dec;

    struct Fixture {
        monitor: UnifiedOrderMonitor,
        broker: Arc<MockBroker>,
        orders: Arc<InMemoryOrderRepository>,
        lifecycle: Arc<OrderLifecycleService>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MockBroker::new());
        let orders = Arc::new(InMemoryOrderRepository::new());
        let positions = Arc::new(InMemoryPositionRepository::new());
        let tracking = Arc::new(InMemoryTrackingRepository::new());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(RateLimitedNotifier::new(transport.clone(), 100, 1000));
        let lifecycle = Arc::new(OrderLifecycleService::new(
            orders.clone(),
            positions,
            tracking,
            notifier.clone(),
        ));
        let monitor = UnifiedOrderMonitor::new(
            1,
            broker.clone(),
            orders.clone(),
            lifecycle.clone(),
            notifier,
            Duration::from_millis(10),
        );
        Fixture {
            monitor,
            broker,
            orders,
            lifecycle,
            transport,
        }
    }

    async fn place_tracked_order(f: &Fixture, local_id: &str, side: OrderSide) -> Order {
        let req = crate::domain::ports::OrderRequest {
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: dec!(10),
            price: Some(dec!(2500)),
            tag: local_id.to_string(),
        };
        let receipt = f.broker.place_order(&req).await.unwrap();

        let now = Utc::now();
        let order = Order {
            user_id: 1,
            local_id: local_id.to_string(),
            broker_order_id: receipt.broker_order_id,
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side,
            order_type: OrderType::Limit,
            variety: Variety::Regular,
            quantity: dec!(10),
            price: Some(dec!(2500)),
            status: OrderStatus::Pending,
            reason: None,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            last_status_check: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            original_price: Some(dec!(2500)),
            original_quantity: Some(dec!(10)),
            is_manual: false,
            cancel_requested: false,
            source_order_id: None,
            placed_at: now,
            updated_at: now,
        };
        f.lifecycle.create_pending(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_execution_drives_pending_to_ongoing() {
        let f = fixture();
        let order = place_tracked_order(&f, "o1", OrderSide::Buy).await;
        let broker_id = order.broker_order_id.clone().unwrap();

        f.broker.set_entry_state(
            &broker_id,
            BrokerOrderState::Executed {
                qty: dec!(10),
                price: dec!(2500),
            },
        );

        let report = f.monitor.monitor_all_orders(Utc::now()).await.unwrap();
        assert_eq!(report.executed, 1);
        assert!(!report.aborted);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Ongoing);

        let map = f.monitor.verification_map().await;
        assert_eq!(map.get("o1").unwrap().status_after, OrderStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_transient_error_aborts_tick_without_writes() {
        let f = fixture();
        let order = place_tracked_order(&f, "o1", OrderSide::Buy).await;

        f.broker.fail_next(BrokerError::Transient {
            reason: "HTTP 503".to_string(),
        });

        let report = f.monitor.monitor_all_orders(Utc::now()).await.unwrap();
        assert!(report.aborted);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.last_status_check, order.last_status_check);
    }

    #[tokio::test]
    async fn test_manual_cancel_detected() {
        let f = fixture();
        let order = place_tracked_order(&f, "o1", OrderSide::Sell).await;
        let broker_id = order.broker_order_id.clone().unwrap();

        // Cancelled at the broker, but no local cancel request exists
        f.broker.set_entry_state(&broker_id, BrokerOrderState::Cancelled);

        let report = f.monitor.monitor_all_orders(Utc::now()).await.unwrap();
        assert_eq!(report.cancelled, 1);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.reason.as_deref(), Some("manual cancellation"));

        let manual = f
            .transport
            .messages_of(crate::domain::ports::EventKind::ManualActivityDetected);
        assert_eq!(manual.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_stays_pending() {
        let f = fixture();
        let order = place_tracked_order(&f, "o1", OrderSide::Sell).await;
        let broker_id = order.broker_order_id.clone().unwrap();

        f.broker.set_entry_state(
            &broker_id,
            BrokerOrderState::PartiallyFilled {
                filled_qty: dec!(4),
            },
        );

        let report = f.monitor.monitor_all_orders(Utc::now()).await.unwrap();
        assert_eq!(report.partial, 1);

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.execution_qty, Some(dec!(4)));
    }

    #[tokio::test]
    async fn test_verify_after_placement_catches_rejection() {
        let f = fixture();
        let order = place_tracked_order(&f, "o1", OrderSide::Buy).await;
        let broker_id = order.broker_order_id.clone().unwrap();

        f.broker.set_entry_state(
            &broker_id,
            BrokerOrderState::Rejected {
                reason: "RMS: insufficient balance".to_string(),
            },
        );

        f.monitor.verify_after_placement("o1").await.unwrap();

        let stored = f.orders.find(1, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(stored.first_failed_at.is_some());
    }
}
