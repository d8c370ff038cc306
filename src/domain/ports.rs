use crate::domain::errors::BrokerError;
use crate::domain::types::{
    BrokerOrderState, Candle, OrderSide, OrderType, Recommendation, Variety,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Outgoing placement request. `tag` carries our local order id so that the
/// broker echo can be correlated back.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub ticker: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub variety: Variety,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct OrderChanges {
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct PlacementReceipt {
    pub local_ack_id: String,
    pub broker_order_id: Option<String>,
    pub immediate_state: Option<BrokerOrderState>,
}

/// One row of the broker's order book, already mapped into the closed
/// `BrokerOrderState` sum type.
#[derive(Debug, Clone)]
pub struct OrderBookEntry {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub state: BrokerOrderState,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub tag: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub entries: Vec<OrderBookEntry>,
    pub fetched_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn by_broker_id(&self, broker_order_id: &str) -> Option<&OrderBookEntry> {
        self.entries
            .iter()
            .find(|e| e.broker_order_id == broker_order_id)
    }
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct HoldingsSnapshot {
    pub holdings: Vec<Holding>,
    pub fetched_at: DateTime<Utc>,
}

impl HoldingsSnapshot {
    pub fn quantity_of(&self, symbol: &str) -> Decimal {
        self.holdings
            .iter()
            .find(|h| h.symbol == symbol)
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct AccountLimits {
    pub available_cash: Decimal,
}

/// One authenticated broker session per user. Session expiry is handled
/// inside the adapter: a failing call triggers a single serialized
/// re-authentication and one retry before `SessionExpired` escapes.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacementReceipt, BrokerError>;

    async fn modify_order(
        &self,
        broker_order_id: &str,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn list_orders(&self) -> Result<OrderBookSnapshot, BrokerError>;

    async fn list_holdings(&self) -> Result<HoldingsSnapshot, BrokerError>;

    async fn get_limits(&self) -> Result<AccountLimits, BrokerError>;

    async fn historical_candles(
        &self,
        ticker: &str,
        days: u32,
        interval: &str,
        include_today: bool,
    ) -> Result<Vec<Candle>, BrokerError>;
}

/// Underlying live-price transport. The subscription manager is the only
/// caller; holders never touch this directly.
#[async_trait]
pub trait LtpStream: Send + Sync {
    async fn subscribe(&self, symbols: &[String]) -> Result<()>;
    async fn unsubscribe(&self, symbols: &[String]) -> Result<()>;
}

/// The analysis pipeline, seen from the supervisor: an opaque producer of
/// recommendations.
#[async_trait]
pub trait RecommendationSource: Send + Sync {
    async fn latest(&self, user_id: i64) -> Result<Vec<Recommendation>>;

    /// Kick a fresh analysis run. Admin-triggered; default is a no-op for
    /// sources that refresh on their own cadence.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderPlaced,
    OrderExecuted,
    OrderRejected,
    OrderCancelled,
    RetryQueueUpdated,
    ManualActivityDetected,
    TrackingStopped,
    DailySummary,
    AuthRefreshed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "order_placed",
            EventKind::OrderExecuted => "order_executed",
            EventKind::OrderRejected => "order_rejected",
            EventKind::OrderCancelled => "order_cancelled",
            EventKind::RetryQueueUpdated => "retry_queue_updated",
            EventKind::ManualActivityDetected => "manual_activity_detected",
            EventKind::TrackingStopped => "tracking_stopped",
            EventKind::DailySummary => "daily_summary",
            EventKind::AuthRefreshed => "auth_refreshed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub user_id: i64,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Where rate-limited notifications are finally delivered (chat transport,
/// webhook, log sink). Failures must never propagate to trading code.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}
