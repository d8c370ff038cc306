use crate::application::indicators::IndicatorService;
use crate::application::market_data::MarketDataService;
use crate::application::monitor::UnifiedOrderMonitor;
use crate::application::orders::{OrderLifecycleService, OrderService, RetryQueue};
use crate::application::reconciliation::ReconciliationEngine;
use crate::domain::ports::{BrokerAdapter, EventKind, OrderChanges, RecommendationSource};
use crate::domain::repositories::{OrderRepository, PositionRepository};
use crate::domain::types::{OrderSide, OrderStatus, TaskName, Variety};
use crate::infrastructure::notification::RateLimitedNotifier;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The bodies of the scheduled tasks for one user. The supervisor (or a
/// run-once request) invokes `run`; everything here is sequential within a
/// tick so repository writes stay ordered.
pub struct TaskRunner {
    pub user_id: i64,
    pub monitor: Arc<UnifiedOrderMonitor>,
    pub retry_queue: Arc<RetryQueue>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub order_service: Arc<OrderService>,
    pub market_data: Arc<MarketDataService>,
    pub indicators: Arc<IndicatorService>,
    pub recommendations: Arc<dyn RecommendationSource>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub orders: Arc<dyn OrderRepository>,
    pub positions: Arc<dyn PositionRepository>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub notifier: Arc<RateLimitedNotifier>,
    pub tick_size: Decimal,
}

impl TaskRunner {
    pub async fn run(&self, task: TaskName, now: DateTime<Utc>) -> Result<String> {
        match task {
            TaskName::PremarketRetry => self.premarket_retry(now).await,
            TaskName::SellMonitor => self.sell_monitor_tick(now).await,
            TaskName::PositionMonitor => self.position_monitor(now).await,
            TaskName::Analysis => self.analysis().await,
            TaskName::BuyOrders => self.buy_orders().await,
            TaskName::EodCleanup => self.eod_cleanup(now).await,
        }
    }

    async fn premarket_retry(&self, now: DateTime<Utc>) -> Result<String> {
        let report = self.retry_queue.run_premarket(self.user_id, now).await?;
        Ok(format!(
            "retry pass: {} examined, {} dispatched, {} expired",
            report.examined, report.dispatched, report.expired
        ))
    }

    /// One monitor tick plus sell-side maintenance. The reconciliation
    /// sub-step reuses the tick's order-book snapshot; nothing fetches the
    /// book a second time.
    async fn sell_monitor_tick(&self, now: DateTime<Utc>) -> Result<String> {
        let report = self.monitor.monitor_all_orders(now).await?;
        if report.aborted {
            return Ok("tick abandoned (broker fetch failed)".to_string());
        }

        if let Some(book) = &report.book {
            match self.broker.list_holdings().await {
                Ok(holdings) => {
                    if let Err(e) = self.reconciliation.reconcile(&holdings, book).await {
                        warn!("TaskRunner: Reconciliation sub-step failed: {}", e);
                    }
                }
                Err(e) => warn!("TaskRunner: Holdings fetch failed, reconciliation skipped: {}", e),
            }
        }

        let placed = self.maintain_sell_orders().await?;
        Ok(format!(
            "monitored {} orders ({} executed), {} sell orders maintained",
            report.checked, report.executed, placed
        ))
    }

    /// Limit sells at the EMA9-derived intraday target for every open
    /// position, re-pointed when the target drifts by more than one tick.
    async fn maintain_sell_orders(&self) -> Result<usize> {
        let mut touched = 0;

        for position in self.positions.open_positions(self.user_id).await? {
            if position.quantity <= Decimal::ZERO {
                continue;
            }

            let Some(quote) = self
                .market_data
                .realtime_price(&position.symbol, &position.symbol)
                .await
            else {
                debug!("TaskRunner: No price for {}, sell deferred", position.symbol);
                continue;
            };
            if quote.stale {
                debug!("TaskRunner: Stale price for {}, sell deferred", position.symbol);
                continue;
            }

            let Some(target) = self
                .indicators
                .ema9_realtime(&position.symbol, quote.price)
                .await
            else {
                debug!("TaskRunner: No EMA9 target for {}, sell deferred", position.symbol);
                continue;
            };
            let target = self.order_service.snap_to_tick(target);

            match self
                .orders
                .find_pending_for_symbol(self.user_id, &position.symbol, OrderSide::Sell)
                .await?
            {
                Some(existing) => {
                    let current = existing.price.unwrap_or_default();
                    if (target - current).abs() > self.tick_size {
                        if let Some(broker_id) = &existing.broker_order_id {
                            let changes = OrderChanges {
                                price: Some(target),
                                quantity: None,
                            };
                            if let Err(e) = self.broker.modify_order(broker_id, &changes).await {
                                warn!(
                                    "TaskRunner: Target re-point for {} failed: {}",
                                    position.symbol, e
                                );
                                continue;
                            }
                            let mut updated = existing.clone();
                            updated.price = Some(target);
                            // Ours, not a manual modification
                            updated.original_price = Some(target);
                            updated.updated_at = Utc::now();
                            self.orders.update(&updated).await?;
                            info!(
                                "TaskRunner: Sell target for {} moved {} -> {}",
                                position.symbol, current, target
                            );
                            touched += 1;
                        }
                    }
                }
                None => {
                    if let Some(order) = self
                        .order_service
                        .place_sell_for_position(&position, target)
                        .await?
                    {
                        self.spawn_placement_verify(&order.local_id);
                        touched += 1;
                    }
                }
            }
        }

        Ok(touched)
    }

    async fn position_monitor(&self, _now: DateTime<Utc>) -> Result<String> {
        let positions = self.positions.open_positions(self.user_id).await?;
        self.market_data
            .warm_for_positions(&positions, "position_monitor")
            .await;

        let holdings = self.broker.list_holdings().await?;
        let book = self.broker.list_orders().await?;
        let report = self.reconciliation.reconcile(&holdings, &book).await?;

        Ok(format!(
            "{} positions; recon: {} manual buys, {} manual sells, {} cancels, {} modifications",
            positions.len(),
            report.manual_buys,
            report.manual_sells,
            report.external_cancels,
            report.external_modifications
        ))
    }

    async fn analysis(&self) -> Result<String> {
        self.recommendations.refresh().await?;
        Ok("analysis refresh requested".to_string())
    }

    /// Place AMO buys for the day's recommendations.
    async fn buy_orders(&self) -> Result<String> {
        let recs = self.recommendations.latest(self.user_id).await?;
        if recs.is_empty() {
            return Ok("no recommendations".to_string());
        }
        self.market_data
            .warm_for_recommendations(&recs, "buy_orders")
            .await;

        let mut placed = 0;
        for rec in &recs {
            let reference = match rec.entry_price_hint {
                Some(hint) if hint > Decimal::ZERO => hint,
                _ => match self.market_data.realtime_price(&rec.symbol, &rec.ticker).await {
                    // AMO placement runs after close; a stale close is fine
                    Some(quote) if quote.price > Decimal::ZERO => quote.price,
                    _ => {
                        warn!("TaskRunner: No reference price for {}, skipped", rec.symbol);
                        continue;
                    }
                },
            };

            match self
                .order_service
                .place_buy_from_recommendation(self.user_id, rec, Variety::Amo, reference)
                .await
            {
                Ok(Some(order)) if order.status == OrderStatus::Pending => {
                    self.spawn_placement_verify(&order.local_id);
                    placed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("TaskRunner: Buy placement for {} failed: {}", rec.symbol, e),
            }
        }

        Ok(format!("{} of {} recommendations placed", placed, recs.len()))
    }

    /// Cancel dead rows that never reached the broker book and emit the
    /// daily summary.
    async fn eod_cleanup(&self, now: DateTime<Utc>) -> Result<String> {
        let pending = self
            .orders
            .find_by_status(self.user_id, OrderStatus::Pending)
            .await?;

        let mut cleaned = 0;
        for order in pending {
            let unacked = order.broker_order_id.is_none();
            let old_enough = now - order.placed_at > ChronoDuration::hours(1);
            if unacked && old_enough {
                self.lifecycle
                    .record_cancellation(&order, "stale order cleanup", now)
                    .await?;
                cleaned += 1;
            }
        }

        let stats = self.orders.statistics(self.user_id).await?;
        self.notifier
            .notify(
                EventKind::DailySummary,
                self.user_id,
                format!(
                    "EOD: {} pending, {} ongoing, {} failed, {} closed, {} cancelled ({} stale rows cleaned)",
                    stats.pending, stats.ongoing, stats.failed, stats.closed, stats.cancelled, cleaned
                ),
            )
            .await;

        Ok(format!("{} stale rows cleaned", cleaned))
    }

    /// Post-placement verification runs off the scheduler loop.
    fn spawn_placement_verify(&self, local_id: &str) {
        let monitor = self.monitor.clone();
        let local_id = local_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = monitor.verify_after_placement(&local_id).await {
                warn!("TaskRunner: Post-placement verify for {} failed: {}", local_id, e);
            }
        });
    }
}
