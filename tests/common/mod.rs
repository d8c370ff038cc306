//! Shared fixture: the full per-user service graph wired against the
//! scriptable mock broker and in-memory repositories.

#![allow(dead_code)]

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradewarden::application::indicators::IndicatorService;
use tradewarden::application::market_data::HistoricalService;
use tradewarden::application::monitor::UnifiedOrderMonitor;
use tradewarden::application::orders::{OrderLifecycleService, OrderService, RetryQueue};
use tradewarden::application::validation::ValidationService;
use tradewarden::domain::market_calendar::MarketCalendar;
use tradewarden::domain::types::Candle;
use tradewarden::infrastructure::in_memory::{
    InMemoryOrderRepository, InMemoryPositionRepository, InMemoryTrackingRepository,
};
use tradewarden::infrastructure::mock::{MockBroker, RecordingTransport};
use tradewarden::infrastructure::notification::RateLimitedNotifier;

pub const USER: i64 = 1;

pub struct Harness {
    pub broker: Arc<MockBroker>,
    pub orders: Arc<InMemoryOrderRepository>,
    pub positions: Arc<InMemoryPositionRepository>,
    pub tracking: Arc<InMemoryTrackingRepository>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub validation: Arc<ValidationService>,
    pub order_service: Arc<OrderService>,
    pub monitor: Arc<UnifiedOrderMonitor>,
    pub retry_queue: Arc<RetryQueue>,
    pub transport: Arc<RecordingTransport>,
}

pub fn harness() -> Harness {
    let broker = Arc::new(MockBroker::new());
    let orders = Arc::new(InMemoryOrderRepository::new());
    let positions = Arc::new(InMemoryPositionRepository::new());
    let tracking = Arc::new(InMemoryTrackingRepository::new());
    let transport = Arc::new(RecordingTransport::default());
    let notifier = Arc::new(RateLimitedNotifier::new(transport.clone(), 1000, 10000));
    let calendar = MarketCalendar::default_equity();

    let historical = Arc::new(HistoricalService::new(
        broker.clone(),
        calendar.clone(),
        Duration::from_secs(60),
        Duration::from_secs(21600),
    ));
    let indicators = Arc::new(IndicatorService::new(historical, Duration::from_secs(60)));

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
        indicators,
        None,
        6,
        dec!(1),
    ));
    let order_service = Arc::new(OrderService::new(
        broker.clone(),
        orders.clone(),
        lifecycle.clone(),
        validation.clone(),
        notifier.clone(),
        dec!(0.05),
        dec!(25000),
    ));
    let monitor = Arc::new(UnifiedOrderMonitor::new(
        USER,
        broker.clone(),
        orders.clone(),
        lifecycle.clone(),
        notifier.clone(),
        Duration::from_millis(10),
    ));
    let retry_queue = Arc::new(RetryQueue::new(
        orders.clone(),
        lifecycle.clone(),
        order_service.clone(),
        validation.clone(),
        broker.clone(),
        calendar,
        notifier,
    ));

    Harness {
        broker,
        orders,
        positions,
        tracking,
        lifecycle,
        validation,
        order_service,
        monitor,
        retry_queue,
        transport,
    }
}

/// Flat daily candle series long enough for every indicator.
pub fn seed_candles(broker: &MockBroker, ticker: &str, close: Decimal, volume: Decimal) {
    let candles: Vec<Candle> = (0..250)
        .map(|i| Candle {
            ticker: ticker.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
            timestamp: 1_700_000_000 + i * 86_400,
        })
        .collect();
    broker.set_candles(ticker, candles);
}

/// A UTC instant expressed in market-local (IST) wall time.
pub fn ist(date: &str, time: &str) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
    let naive =
        chrono::NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
            .unwrap();
    offset
        .from_local_datetime(&naive)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}
