use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("Unknown order side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            other => Err(format!("Unknown order type: {}", other)),
        }
    }
}

/// AMO orders are queued for the next session open; regular orders hit the
/// book immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variety {
    Amo,
    Regular,
}

impl fmt::Display for Variety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variety::Amo => write!(f, "AMO"),
            Variety::Regular => write!(f, "REGULAR"),
        }
    }
}

impl std::str::FromStr for Variety {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AMO" => Ok(Variety::Amo),
            "REGULAR" => Ok(Variety::Regular),
            other => Err(format!("Unknown variety: {}", other)),
        }
    }
}

/// Canonical order lifecycle status.
///
/// `Pending`: placed with the broker, awaiting a terminal broker state.
/// `Ongoing`: executed, position open (buy) or partially exited (sell).
/// `Failed`: rejected or not placeable; retriable until expiry.
/// `Closed`: fully executed and reconciled, or dropped.
/// `Cancelled`: terminally withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Ongoing,
    Failed,
    Closed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Closed | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ongoing => "ongoing",
            OrderStatus::Failed => "failed",
            OrderStatus::Closed => "closed",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "ongoing" => Ok(OrderStatus::Ongoing),
            "failed" => Ok(OrderStatus::Failed),
            "closed" => Ok(OrderStatus::Closed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("Unknown order status: {}", other)),
        }
    }
}

/// A tracked order row. Identity is `(user_id, local_id)`; once the broker
/// accepts the order it also carries `broker_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub user_id: i64,
    pub local_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub ticker: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub variety: Variety,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub reason: Option<String>,
    pub retry_count: u32,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub last_retry_attempt: Option<DateTime<Utc>>,
    pub last_status_check: Option<DateTime<Utc>>,
    pub execution_price: Option<Decimal>,
    pub execution_qty: Option<Decimal>,
    pub execution_time: Option<DateTime<Utc>>,
    /// Price/qty as originally placed, kept for external-modification detection.
    pub original_price: Option<Decimal>,
    pub original_quantity: Option<Decimal>,
    pub is_manual: bool,
    pub cancel_requested: bool,
    /// Parent order when this row was created by a retry dispatch.
    pub source_order_id: Option<String>,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Ongoing)
    }
}

/// An open (or historical) position. At most one open position per
/// `(user_id, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: i64,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Volume-weighted average across a re-entry.
    pub fn absorb_fill(&mut self, qty: Decimal, price: Decimal) {
        let total = self.quantity + qty;
        if total > Decimal::ZERO {
            self.avg_price = (self.avg_price * self.quantity + price * qty) / total;
        }
        self.quantity = total;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Buy,
    StrongBuy,
    Watch,
    Avoid,
}

/// Opaque output of the analysis pipeline; the supervisor does not second-guess it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub ticker: String,
    pub symbol: String,
    pub suggested_qty: Option<Decimal>,
    pub suggested_capital: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub entry_price_hint: Option<Decimal>,
    pub verdict: Verdict,
    pub indicators_snapshot: Option<IndicatorSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Websocket,
    Historical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceObservation {
    pub symbol: String,
    pub ltp: Decimal,
    pub received_at: DateTime<Utc>,
    pub source: PriceSource,
}

/// Result of a price-cache lookup; `stale` is set when the observation is
/// older than the configured staleness bound or came from a historical bar.
#[derive(Debug, Clone)]
pub struct QuotedPrice {
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub close: Option<Decimal>,
    pub rsi: Option<Decimal>,
    pub ema9: Option<Decimal>,
    pub ema200: Option<Decimal>,
    pub avg_volume: Option<Decimal>,
}

impl IndicatorSnapshot {
    /// The risk-sizing prerequisites: close, RSI and the fast EMA.
    pub fn is_complete(&self) -> bool {
        self.close.is_some() && self.rsi.is_some() && self.ema9.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ticker: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingStatus {
    Active,
    Completed,
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingStatus::Active => write!(f, "active"),
            TrackingStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for TrackingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TrackingStatus::Active),
            "completed" => Ok(TrackingStatus::Completed),
            other => Err(format!("Unknown tracking status: {}", other)),
        }
    }
}

/// Per-user-per-symbol bookkeeping separating system-originated quantity
/// from holdings that existed before tracking began. References orders by
/// id only, never by shared handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingScope {
    pub user_id: i64,
    pub symbol: String,
    pub system_qty: Decimal,
    pub pre_existing_qty: Decimal,
    pub current_tracked_qty: Decimal,
    pub tracking_status: TrackingStatus,
    pub initial_order_id: Option<String>,
    pub related_order_ids: Vec<String>,
    pub recommendation_source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskName {
    PremarketRetry,
    SellMonitor,
    PositionMonitor,
    Analysis,
    BuyOrders,
    EodCleanup,
}

impl TaskName {
    pub fn all() -> [TaskName; 6] {
        [
            TaskName::PremarketRetry,
            TaskName::SellMonitor,
            TaskName::PositionMonitor,
            TaskName::Analysis,
            TaskName::BuyOrders,
            TaskName::EodCleanup,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::PremarketRetry => "premarket_retry",
            TaskName::SellMonitor => "sell_monitor",
            TaskName::PositionMonitor => "position_monitor",
            TaskName::Analysis => "analysis",
            TaskName::BuyOrders => "buy_orders",
            TaskName::EodCleanup => "eod_cleanup",
        }
    }

    /// Tasks that read live prices must not run outside market hours even
    /// when dispatched ad hoc.
    pub fn requires_live_prices(&self) -> bool {
        matches!(self, TaskName::SellMonitor | TaskName::PositionMonitor)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "premarket_retry" => Ok(TaskName::PremarketRetry),
            "sell_monitor" => Ok(TaskName::SellMonitor),
            "position_monitor" => Ok(TaskName::PositionMonitor),
            "analysis" => Ok(TaskName::Analysis),
            "buy_orders" => Ok(TaskName::BuyOrders),
            "eod_cleanup" => Ok(TaskName::EodCleanup),
            other => Err(format!("Unknown task name: {}", other)),
        }
    }
}

/// Admin-editable trigger definition for one task, global across users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub task: TaskName,
    pub schedule_time: NaiveTime,
    pub enabled: bool,
    pub is_hourly: bool,
    pub is_continuous: bool,
    pub end_time: Option<NaiveTime>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted run state for one user x task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub user_id: i64,
    pub task: TaskName,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub process_handle: Option<String>,
}

/// Closed mapping of broker order-book statuses. Every broker response is
/// funnelled through this before any lifecycle decision is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerOrderState {
    Open,
    TriggerPending,
    AmoReceived,
    PartiallyFilled { filled_qty: Decimal },
    Executed { qty: Decimal, price: Decimal },
    Rejected { reason: String },
    Cancelled,
}

/// Per-tick verification record published by the unified monitor and read
/// by every downstream collaborator in the same tick.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub local_id: String,
    pub broker_order_id: Option<String>,
    pub state: BrokerOrderState,
    pub status_after: OrderStatus,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStatistics {
    pub pending: i64,
    pub ongoing: i64,
    pub failed: i64,
    pub closed: i64,
    pub cancelled: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Ongoing,
            OrderStatus::Failed,
            OrderStatus::Closed,
            OrderStatus::Cancelled,
        ] {
            let parsed = OrderStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(OrderStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Closed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Failed.is_terminal());
    }

    #[test]
    fn test_position_absorb_fill_weighted_average() {
        let mut pos = Position {
            user_id: 1,
            symbol: "ACME".to_string(),
            quantity: dec!(10),
            avg_price: dec!(100),
            opened_at: Utc::now(),
            closed_at: None,
        };

        pos.absorb_fill(dec!(10), dec!(110));

        assert_eq!(pos.quantity, dec!(20));
        assert_eq!(pos.avg_price, dec!(105));
    }

    #[test]
    fn test_task_name_roundtrip() {
        for task in TaskName::all() {
            assert_eq!(TaskName::from_str(task.as_str()).unwrap(), task);
        }
    }
}
