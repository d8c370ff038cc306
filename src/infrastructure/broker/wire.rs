//! Wire-format DTOs for the broker's REST API and their mapping into the
//! closed `BrokerOrderState` sum type. No lifecycle decision is taken on a
//! raw broker string; everything is funnelled through `map_state` first.

use crate::domain::ports::{Holding, OrderBookEntry};
use crate::domain::types::{BrokerOrderState, Candle, OrderSide};
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct WireOrder {
    pub order_id: String,
    pub tradingsymbol: String,
    pub transaction_type: String,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub filled_quantity: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub order_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WireHolding {
    pub tradingsymbol: String,
    pub quantity: f64,
    pub average_price: f64,
}

#[derive(Debug, Deserialize)]
pub struct WireLimits {
    pub available_cash: f64,
}

#[derive(Debug, Deserialize)]
pub struct WireCandle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
pub struct WirePlacement {
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireSession {
    pub access_token: String,
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}

/// Broker status string -> closed state. Unknown strings with fills are
/// treated as open partials; fully unknown strings map to `Open` so the
/// monitor keeps watching rather than guessing a terminal state.
pub fn map_state(
    status: &str,
    filled_qty: Decimal,
    quantity: Decimal,
    average_price: Option<Decimal>,
    status_message: Option<&str>,
) -> BrokerOrderState {
    let normalized = status.trim().to_uppercase();
    match normalized.as_str() {
        "COMPLETE" | "EXECUTED" | "FILLED" => BrokerOrderState::Executed {
            qty: if filled_qty > Decimal::ZERO { filled_qty } else { quantity },
            price: average_price.unwrap_or_default(),
        },
        "REJECTED" => BrokerOrderState::Rejected {
            reason: status_message.unwrap_or("rejected by broker").to_string(),
        },
        "CANCELLED" | "CANCELED" => BrokerOrderState::Cancelled,
        "TRIGGER PENDING" => BrokerOrderState::TriggerPending,
        "AMO REQ RECEIVED" | "AMO RECEIVED" | "PUT ORDER REQ RECEIVED" => {
            BrokerOrderState::AmoReceived
        }
        _ => {
            if filled_qty > Decimal::ZERO && filled_qty < quantity {
                BrokerOrderState::PartiallyFilled { filled_qty }
            } else {
                BrokerOrderState::Open
            }
        }
    }
}

impl WireOrder {
    pub fn into_entry(self) -> OrderBookEntry {
        let quantity = dec(self.quantity);
        let filled_qty = dec(self.filled_quantity);
        let avg_fill_price = self.average_price.map(dec).filter(|p| *p > Decimal::ZERO);
        let state = map_state(
            &self.status,
            filled_qty,
            quantity,
            avg_fill_price,
            self.status_message.as_deref(),
        );

        OrderBookEntry {
            broker_order_id: self.order_id,
            symbol: self.tradingsymbol,
            side: OrderSide::from_str(&self.transaction_type).unwrap_or(OrderSide::Buy),
            quantity,
            price: self.price.map(dec),
            state,
            filled_qty,
            avg_fill_price,
            tag: self.tag,
            updated_at: self
                .order_timestamp
                .and_then(|t| DateTime::from_timestamp(t, 0)),
        }
    }
}

impl WireHolding {
    pub fn into_holding(self) -> Holding {
        Holding {
            symbol: self.tradingsymbol,
            quantity: dec(self.quantity),
            avg_price: dec(self.average_price),
        }
    }
}

impl WireCandle {
    pub fn into_candle(self, ticker: &str) -> Candle {
        Candle {
            ticker: ticker.to_string(),
            open: dec(self.open),
            high: dec(self.high),
            low: dec(self.low),
            close: dec(self.close),
            volume: dec(self.volume),
            timestamp: self.timestamp,
        }
    }
}
