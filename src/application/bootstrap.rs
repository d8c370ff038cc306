//! Service-graph construction: everything is wired here, once, and owned
//! by the supervisor for the life of the process.

use crate::application::indicators::IndicatorService;
use crate::application::market_data::{
    HistoricalService, LtpCache, MarketDataService, SubscriptionManager,
};
use crate::application::monitor::UnifiedOrderMonitor;
use crate::application::orders::{OrderLifecycleService, OrderService, RetryQueue};
use crate::application::reconciliation::ReconciliationEngine;
use crate::application::supervisor::{ServiceManager, TaskRunner};
use crate::application::validation::ValidationService;
use crate::config::Config;
use crate::domain::ports::RecommendationSource;
use crate::domain::repositories::{
    OrderRepository, PositionRepository, ScheduleRepository, ServiceStatusRepository,
    TrackingRepository,
};
use crate::infrastructure::broker::{HttpBrokerAdapter, LtpWebSocket};
use crate::infrastructure::notification::{LogTransport, RateLimitedNotifier};
use crate::infrastructure::persistence::{
    Database, SqliteOrderRepository, SqlitePositionRepository, SqliteScheduleRepository,
    SqliteServiceStatusRepository, SqliteTrackingRepository,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Application {
    pub config: Config,
    pub service_manager: Arc<ServiceManager>,
    pub orders: Arc<dyn OrderRepository>,
    pub order_services: HashMap<i64, Arc<OrderService>>,
}

impl Application {
    pub async fn build(
        config: Config,
        recommendations: Arc<dyn RecommendationSource>,
    ) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let calendar = config.market_calendar();

        let orders: Arc<dyn OrderRepository> =
            Arc::new(SqliteOrderRepository::new(db.pool.clone()));
        let positions: Arc<dyn PositionRepository> =
            Arc::new(SqlitePositionRepository::new(db.pool.clone()));
        let tracking: Arc<dyn TrackingRepository> =
            Arc::new(SqliteTrackingRepository::new(db.pool.clone()));
        let schedules: Arc<dyn ScheduleRepository> =
            Arc::new(SqliteScheduleRepository::new(db.pool.clone()));
        let statuses: Arc<dyn ServiceStatusRepository> =
            Arc::new(SqliteServiceStatusRepository::new(db.pool.clone()));

        let notifier = Arc::new(RateLimitedNotifier::new(
            Arc::new(LogTransport),
            config.supervisor.notify_per_minute,
            config.supervisor.notify_per_hour,
        ));

        let sup = &config.supervisor;
        let mut runners: HashMap<i64, Arc<TaskRunner>> = HashMap::new();
        let mut order_services: HashMap<i64, Arc<OrderService>> = HashMap::new();

        for &user_id in &config.user_ids {
            let (api_key, api_secret) = config.broker.credentials_for_user(user_id);
            let broker = Arc::new(HttpBrokerAdapter::new(
                config.broker.base_url.clone(),
                api_key,
                api_secret,
                user_id,
                Duration::from_secs(sup.broker_call_timeout_seconds),
            ));

            let cache = Arc::new(LtpCache::new());
            let stream = Arc::new(LtpWebSocket::new(
                config.broker.ws_url.clone(),
                cache.clone(),
            ));
            stream.start().await;
            let subscriptions = Arc::new(SubscriptionManager::new(stream));

            let historical = Arc::new(HistoricalService::new(
                broker.clone(),
                calendar.clone(),
                Duration::from_secs(sup.historical_ttl_market_seconds),
                Duration::from_secs(sup.historical_ttl_offhours_seconds),
            ));
            let market_data = Arc::new(MarketDataService::new(
                cache,
                subscriptions,
                historical.clone(),
                calendar.clone(),
                Duration::from_secs(sup.max_staleness_seconds),
                Duration::from_secs(sup.max_staleness_offhours_seconds),
            ));
            let indicators = Arc::new(IndicatorService::new(
                historical,
                Duration::from_secs(60),
            ));

            let lifecycle = Arc::new(OrderLifecycleService::new(
                orders.clone(),
                positions.clone(),
                tracking.clone(),
                notifier.clone(),
            ));
            let validation = Arc::new(ValidationService::new(
                broker.clone(),
                orders.clone(),
                positions.clone(),
                indicators.clone(),
                None,
                sup.max_portfolio_size,
                sup.min_qty,
            ));
            let order_service = Arc::new(OrderService::new(
                broker.clone(),
                orders.clone(),
                lifecycle.clone(),
                validation.clone(),
                notifier.clone(),
                config.market.tick_size,
                sup.capital_per_trade,
            ));
            let monitor = Arc::new(UnifiedOrderMonitor::new(
                user_id,
                broker.clone(),
                orders.clone(),
                lifecycle.clone(),
                notifier.clone(),
                Duration::from_secs(sup.place_verify_delay_seconds),
            ));
            let retry_queue = Arc::new(RetryQueue::new(
                orders.clone(),
                lifecycle.clone(),
                order_service.clone(),
                validation.clone(),
                broker.clone(),
                calendar.clone(),
                notifier.clone(),
            ));
            let reconciliation = Arc::new(ReconciliationEngine::new(
                user_id,
                tracking.clone(),
                orders.clone(),
                positions.clone(),
                lifecycle.clone(),
                notifier.clone(),
            ));

            let runner = Arc::new(TaskRunner {
                user_id,
                monitor,
                retry_queue,
                reconciliation,
                order_service: order_service.clone(),
                market_data,
                indicators,
                recommendations: recommendations.clone(),
                broker,
                orders: orders.clone(),
                positions: positions.clone(),
                lifecycle,
                notifier: notifier.clone(),
                tick_size: config.market.tick_size,
            });

            runners.insert(user_id, runner);
            order_services.insert(user_id, order_service);
        }

        info!("Application: Wired {} user supervisors", runners.len());

        let service_manager = Arc::new(ServiceManager::new(
            runners,
            schedules,
            statuses,
            calendar,
            sup.monitor_interval_seconds,
            sup.stop_grace_period_seconds,
            sup.run_once_deadline_seconds,
        ));

        Ok(Self {
            config,
            service_manager,
            orders,
            order_services,
        })
    }
}
