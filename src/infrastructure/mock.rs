//! Scriptable collaborators for tests and for running the supervisor
//! without a live broker connection.

use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    AccountLimits, BrokerAdapter, Holding, HoldingsSnapshot, LtpStream, NotificationEvent,
    NotificationTransport, OrderBookEntry, OrderBookSnapshot, OrderChanges, OrderRequest,
    PlacementReceipt, RecommendationSource,
};
use crate::domain::types::{BrokerOrderState, Candle, Recommendation, Variety};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory broker double. The order book, holdings, limits and candle
/// series are all scriptable; `fail_next` injects errors in FIFO order to
/// exercise the transient/session-expiry paths.
pub struct MockBroker {
    pub order_book: Mutex<Vec<OrderBookEntry>>,
    pub holdings: Mutex<Vec<Holding>>,
    pub cash: Mutex<Decimal>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub placements: Mutex<Vec<OrderRequest>>,
    pub cancellations: Mutex<Vec<String>>,
    pub modifications: Mutex<Vec<(String, OrderChanges)>>,
    fail_next: Mutex<VecDeque<BrokerError>>,
    reject_next_placement: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            order_book: Mutex::new(Vec::new()),
            holdings: Mutex::new(Vec::new()),
            cash: Mutex::new(Decimal::ZERO),
            candles: Mutex::new(HashMap::new()),
            placements: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            modifications: Mutex::new(Vec::new()),
            fail_next: Mutex::new(VecDeque::new()),
            reject_next_placement: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_cash(&self, cash: Decimal) {
        *self.cash.lock().unwrap() = cash;
    }

    pub fn set_holdings(&self, holdings: Vec<Holding>) {
        *self.holdings.lock().unwrap() = holdings;
    }

    pub fn set_candles(&self, ticker: &str, candles: Vec<Candle>) {
        self.candles
            .lock()
            .unwrap()
            .insert(ticker.to_string(), candles);
    }

    /// Queue an error for the next broker call.
    pub fn fail_next(&self, error: BrokerError) {
        self.fail_next.lock().unwrap().push_back(error);
    }

    /// The next placement returns `Rejected` with this reason.
    pub fn reject_next_placement(&self, reason: &str) {
        *self.reject_next_placement.lock().unwrap() = Some(reason.to_string());
    }

    /// Script a state change in the broker book (e.g. an execution seen on
    /// the next monitor tick).
    pub fn set_entry_state(&self, broker_order_id: &str, state: BrokerOrderState) {
        let mut book = self.order_book.lock().unwrap();
        if let Some(entry) = book.iter_mut().find(|e| e.broker_order_id == broker_order_id) {
            if let BrokerOrderState::Executed { qty, price } = &state {
                entry.filled_qty = *qty;
                entry.avg_fill_price = Some(*price);
            }
            entry.state = state;
            entry.updated_at = Some(Utc::now());
        }
    }

    /// Add an order-book row the system did not place (manual activity).
    pub fn add_manual_entry(&self, entry: OrderBookEntry) {
        self.order_book.lock().unwrap().push(entry);
    }

    pub fn last_broker_id(&self) -> String {
        format!("B{}", self.next_id.load(Ordering::SeqCst) - 1)
    }

    fn take_failure(&self) -> Option<BrokerError> {
        self.fail_next.lock().unwrap().pop_front()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacementReceipt, BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if let Some(reason) = self.reject_next_placement.lock().unwrap().take() {
            return Err(BrokerError::Rejected { reason });
        }

        self.placements.lock().unwrap().push(req.clone());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let broker_order_id = format!("B{}", id);
        let state = match req.variety {
            Variety::Amo => BrokerOrderState::AmoReceived,
            Variety::Regular => BrokerOrderState::Open,
        };

        self.order_book.lock().unwrap().push(OrderBookEntry {
            broker_order_id: broker_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            price: req.price,
            state: state.clone(),
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            tag: Some(req.tag.clone()),
            updated_at: Some(Utc::now()),
        });

        Ok(PlacementReceipt {
            local_ack_id: req.tag.clone(),
            broker_order_id: Some(broker_order_id),
            immediate_state: Some(state),
        })
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut book = self.order_book.lock().unwrap();
        if let Some(entry) = book.iter_mut().find(|e| e.broker_order_id == broker_order_id) {
            if let Some(price) = changes.price {
                entry.price = Some(price);
            }
            if let Some(qty) = changes.quantity {
                entry.quantity = qty;
            }
        }
        self.modifications
            .lock()
            .unwrap()
            .push((broker_order_id.to_string(), changes.clone()));
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut book = self.order_book.lock().unwrap();
        if let Some(entry) = book.iter_mut().find(|e| e.broker_order_id == broker_order_id) {
            entry.state = BrokerOrderState::Cancelled;
        }
        self.cancellations
            .lock()
            .unwrap()
            .push(broker_order_id.to_string());
        Ok(())
    }

    async fn list_orders(&self) -> Result<OrderBookSnapshot, BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(OrderBookSnapshot {
            entries: self.order_book.lock().unwrap().clone(),
            fetched_at: Utc::now(),
        })
    }

    async fn list_holdings(&self) -> Result<HoldingsSnapshot, BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(HoldingsSnapshot {
            holdings: self.holdings.lock().unwrap().clone(),
            fetched_at: Utc::now(),
        })
    }

    async fn get_limits(&self) -> Result<AccountLimits, BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(AccountLimits {
            available_cash: *self.cash.lock().unwrap(),
        })
    }

    async fn historical_candles(
        &self,
        ticker: &str,
        _days: u32,
        _interval: &str,
        _include_today: bool,
    ) -> Result<Vec<Candle>, BrokerError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self
            .candles
            .lock()
            .unwrap()
            .get(ticker)
            .cloned()
            .unwrap_or_default())
    }
}

/// LTP stream that only records what was asked of it.
#[derive(Default)]
pub struct NullLtpStream {
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

#[async_trait]
impl LtpStream for NullLtpStream {
    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        self.subscribed.lock().unwrap().extend_from_slice(symbols);
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        self.unsubscribed.lock().unwrap().extend_from_slice(symbols);
        Ok(())
    }
}

/// Captures every delivered notification for assertions.
#[derive(Default)]
pub struct RecordingTransport {
    pub delivered: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl RecordingTransport {
    pub fn messages_of(&self, kind: crate::domain::ports::EventKind) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.message.clone())
            .collect()
    }
}

/// Fixed recommendation list, the stand-in for the analysis pipeline.
pub struct FixedRecommendationSource {
    pub recommendations: Mutex<Vec<Recommendation>>,
}

impl FixedRecommendationSource {
    pub fn new(recommendations: Vec<Recommendation>) -> Self {
        Self {
            recommendations: Mutex::new(recommendations),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl RecommendationSource for FixedRecommendationSource {
    async fn latest(&self, _user_id: i64) -> Result<Vec<Recommendation>> {
        Ok(self.recommendations.lock().unwrap().clone())
    }
}
