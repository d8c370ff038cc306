//! Pre-trade gates. A placement or retry attempt must clear every gate,
//! in short-circuit priority order, before it is dispatched to the broker.
//! Validation never mutates anything; disposition is the caller's job.

pub mod gates;

pub use gates::{GateContext, GateOutcome, PretradeGate, RejectReason};

use crate::application::indicators::IndicatorService;
use crate::domain::ports::BrokerAdapter;
use crate::domain::repositories::{OrderRepository, PositionRepository};
use crate::domain::types::{OrderSide, OrderStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What validation was asked about.
#[derive(Debug, Clone)]
pub struct PlacementIntent {
    pub user_id: i64,
    pub symbol: String,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub is_retry: bool,
}

#[derive(Debug, Clone)]
pub enum ValidationVerdict {
    Ok {
        /// Possibly downscaled on the retry path.
        quantity: Decimal,
    },
    Rejected {
        reason: RejectReason,
        detail: String,
    },
}

impl ValidationVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationVerdict::Ok { .. })
    }
}

struct BrokerView {
    holdings_by_symbol: HashMap<String, Decimal>,
    available_cash: Decimal,
    fetched_at: DateTime<Utc>,
}

/// Runs the gate pipeline over a broker-state snapshot that is shared for
/// 2 minutes per user, so a burst of placements does not hammer the
/// holdings and limits endpoints.
pub struct ValidationService {
    broker: Arc<dyn BrokerAdapter>,
    orders: Arc<dyn OrderRepository>,
    positions: Arc<dyn PositionRepository>,
    indicators: Arc<IndicatorService>,
    gates: Vec<Box<dyn PretradeGate>>,
    /// Instrument master loaded at startup; None disables the symbol gate.
    known_symbols: Option<HashSet<String>>,
    broker_view: Mutex<Option<BrokerView>>,
    view_ttl: Duration,
    max_portfolio_size: usize,
    min_qty: Decimal,
}

impl ValidationService {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        orders: Arc<dyn OrderRepository>,
        positions: Arc<dyn PositionRepository>,
        indicators: Arc<IndicatorService>,
        known_symbols: Option<HashSet<String>>,
        max_portfolio_size: usize,
        min_qty: Decimal,
    ) -> Self {
        let mut gates: Vec<Box<dyn PretradeGate>> = vec![
            Box::new(gates::SymbolKnownGate),
            Box::new(gates::DuplicateOrderGate),
            Box::new(gates::PortfolioCapacityGate),
            Box::new(gates::AlreadyHeldGate),
            Box::new(gates::BalanceGate),
            Box::new(gates::VolumeRatioGate),
            Box::new(gates::IndicatorsPresentGate),
        ];
        gates.sort_by_key(|g| g.priority());

        Self {
            broker,
            orders,
            positions,
            indicators,
            gates,
            known_symbols,
            broker_view: Mutex::new(None),
            view_ttl: Duration::from_secs(120),
            max_portfolio_size,
            min_qty,
        }
    }

    pub async fn validate_order_placement(
        &self,
        intent: &PlacementIntent,
    ) -> Result<ValidationVerdict> {
        let view = self.broker_view().await?;
        let open_positions = self.positions.count_open(intent.user_id).await?;

        let pending = self
            .orders
            .find_by_status(intent.user_id, OrderStatus::Pending)
            .await?;
        let in_flight_buys = pending
            .iter()
            .filter(|o| o.side == OrderSide::Buy && o.symbol != intent.symbol)
            .count();
        let has_duplicate_pending = pending
            .iter()
            .any(|o| o.symbol == intent.symbol && o.side == intent.side);

        let indicators = match self.indicators.all_indicators(&intent.ticker).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!("Validation: Indicators unavailable for {}: {}", intent.ticker, e);
                None
            }
        };
        let avg_daily_notional = indicators
            .as_ref()
            .and_then(|s| s.avg_volume)
            .map(|v| v * intent.price);

        let symbol_known = self
            .known_symbols
            .as_ref()
            .is_none_or(|set| set.contains(&intent.symbol));

        let ctx = GateContext {
            side: intent.side,
            symbol: &intent.symbol,
            quantity: intent.quantity,
            price: intent.price,
            is_retry: intent.is_retry,
            symbol_known,
            has_duplicate_pending,
            open_positions,
            in_flight_buys,
            holdings_qty: view
                .holdings_by_symbol
                .get(&intent.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO),
            available_cash: view.available_cash,
            avg_daily_notional,
            indicators: indicators.as_ref(),
            max_portfolio_size: self.max_portfolio_size,
            min_qty: self.min_qty,
        };

        let mut quantity = intent.quantity;
        for gate in &self.gates {
            match gate.check(&ctx).await {
                GateOutcome::Pass => {
                    debug!("Validation: Gate passed: {}", gate.name());
                }
                GateOutcome::Downscale(qty) => {
                    warn!(
                        "Validation: Gate {} downscaled {} from {} to {}",
                        gate.name(),
                        intent.symbol,
                        intent.quantity,
                        qty
                    );
                    quantity = qty;
                }
                GateOutcome::Reject { reason, detail } => {
                    warn!(
                        "Validation: Rejected {} {} at gate {}: {}",
                        intent.side,
                        intent.symbol,
                        gate.name(),
                        detail
                    );
                    return Ok(ValidationVerdict::Rejected { reason, detail });
                }
            }
        }

        Ok(ValidationVerdict::Ok { quantity })
    }

    /// Broker holdings and limits behind the per-user 2-minute cache.
    async fn broker_view(&self) -> Result<BrokerViewRef> {
        let now = Utc::now();
        let mut guard = self.broker_view.lock().await;
        let fresh = guard.as_ref().is_some_and(|v| {
            (now - v.fetched_at).to_std().unwrap_or_default() <= self.view_ttl
        });

        if !fresh {
            let holdings = self.broker.list_holdings().await?;
            let limits = self.broker.get_limits().await?;
            let holdings_by_symbol = holdings
                .holdings
                .into_iter()
                .map(|h| (h.symbol, h.quantity))
                .collect();
            *guard = Some(BrokerView {
                holdings_by_symbol,
                available_cash: limits.available_cash,
                fetched_at: now,
            });
        }

        let view = guard.as_ref().expect("view populated above");
        Ok(BrokerViewRef {
            holdings_by_symbol: view.holdings_by_symbol.clone(),
            available_cash: view.available_cash,
        })
    }

    /// Drop the cached broker view (e.g. after a deposit or an execution).
    pub async fn invalidate_broker_view(&self) {
        *self.broker_view.lock().await = None;
    }
}

struct BrokerViewRef {
    holdings_by_symbol: HashMap<String, Decimal>,
    available_cash: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::market_data::HistoricalService;
    use crate::domain::market_calendar::MarketCalendar;
    use crate::domain::types::Candle;
    use crate::infrastructure::in_memory::{InMemoryOrderRepository, InMemoryPositionRepository};
    use crate::infrastructure::mock::MockBroker;
    use rust_decimal_macros::dec;

    fn flat_candles(ticker: &str, close: Decimal, volume: Decimal) -> Vec<Candle> {
        (0..250)
            .map(|i| Candle {
                ticker: ticker.to_string(),
                open: close,
                high: close,
                low: close,
                close,
                volume,
                timestamp: 1_700_000_000 + i * 86_400,
            })
            .collect()
    }

    fn build_service(broker: Arc<MockBroker>) -> ValidationService {
        let historical = Arc::new(HistoricalService::new(
            broker.clone(),
            MarketCalendar::default_equity(),
            Duration::from_secs(60),
            Duration::from_secs(21600),
        ));
        let indicators = Arc::new(IndicatorService::new(historical, Duration::from_secs(60)));
        ValidationService::new(
            broker,
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(InMemoryPositionRepository::new()),
            indicators,
            None,
            6,
            dec!(1),
        )
    }

    fn intent() -> PlacementIntent {
        PlacementIntent {
            user_id: 1,
            symbol: "ACME".to_string(),
            ticker: "ACME.NS".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            price: dec!(2500),
            is_retry: false,
        }
    }

    #[tokio::test]
    async fn test_happy_path_approves() {
        let broker = Arc::new(MockBroker::new());
        broker.set_cash(dec!(100000));
        broker.set_candles("ACME.NS", flat_candles("ACME.NS", dec!(2500), dec!(500000)));

        let service = build_service(broker);
        let verdict = service.validate_order_placement(&intent()).await.unwrap();
        match verdict {
            ValidationVerdict::Ok { quantity } => assert_eq!(quantity, dec!(10)),
            ValidationVerdict::Rejected { reason, detail } => {
                panic!("Unexpected rejection {:?}: {}", reason, detail)
            }
        }
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejects() {
        let broker = Arc::new(MockBroker::new());
        broker.set_cash(dec!(500));
        broker.set_candles("ACME.NS", flat_candles("ACME.NS", dec!(2500), dec!(500000)));

        let service = build_service(broker);
        let verdict = service.validate_order_placement(&intent()).await.unwrap();
        match verdict {
            ValidationVerdict::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::InsufficientBalance)
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_indicators_reject() {
        let broker = Arc::new(MockBroker::new());
        broker.set_cash(dec!(100000));
        // Only 10 candles: EMA9 computes but RSI(14) does not

        broker.set_candles(
            "ACME.NS",
            flat_candles("ACME.NS", dec!(2500), dec!(500000))
                .into_iter()
                .take(10)
                .collect(),
        );

        let service = build_service(broker);
        let verdict = service.validate_order_placement(&intent()).await.unwrap();
        match verdict {
            ValidationVerdict::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::IndicatorsUnavailable)
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }
}
