//! Deterministic indicator computation (RSI, EMA) over historical series,
//! with a short per-ticker memoization layer.

use crate::application::market_data::HistoricalService;
use crate::domain::types::{Candle, IndicatorSnapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use ta::Next;
use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex};
use tokio::sync::Mutex;
use tracing::debug;

const AVG_VOLUME_WINDOW: usize = 20;

pub struct IndicatorService {
    historical: Arc<HistoricalService>,
    cache: Mutex<HashMap<String, (IndicatorSnapshot, DateTime<Utc>)>>,
    ttl: Duration,
}

impl IndicatorService {
    pub fn new(historical: Arc<HistoricalService>, ttl: Duration) -> Self {
        Self {
            historical,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Standard RSI over the series closes. None when the series is
    /// shorter than the period.
    pub fn rsi(series: &[Decimal], period: usize) -> Option<Decimal> {
        if series.len() <= period {
            return None;
        }
        let mut rsi = RelativeStrengthIndex::new(period).ok()?;
        let mut last = 0.0;
        for value in series {
            last = rsi.next(value.to_f64()?);
        }
        Decimal::from_f64(last)
    }

    /// Exponential moving average over the series closes.
    pub fn ema(series: &[Decimal], period: usize) -> Option<Decimal> {
        if series.len() < period {
            return None;
        }
        let mut ema = ExponentialMovingAverage::new(period).ok()?;
        let mut last = 0.0;
        for value in series {
            last = ema.next(value.to_f64()?);
        }
        Decimal::from_f64(last)
    }

    /// Yesterday's EMA9 advanced by today's LTP: the intraday target used
    /// for limit-sell placement. Smoothing factor 2/(9+1).
    pub async fn ema9_realtime(&self, ticker: &str, ltp: Decimal) -> Option<Decimal> {
        let candles = self
            .historical
            .series(ticker, 250, "day", false)
            .await
            .ok()?;
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let yesterday_ema9 = Self::ema(&closes, 9)?;

        let alpha = Decimal::new(2, 0) / Decimal::new(10, 0);
        Some(alpha * ltp + (Decimal::ONE - alpha) * yesterday_ema9)
    }

    /// Batch accessor, memoized per ticker for `ttl`.
    pub async fn all_indicators(&self, ticker: &str) -> Result<IndicatorSnapshot> {
        let now = Utc::now();
        {
            let cache = self.cache.lock().await;
            if let Some((snapshot, computed_at)) = cache.get(ticker) {
                let age = (now - *computed_at).to_std().unwrap_or_default();
                if age <= self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let candles = self
            .historical
            .series(ticker, 250, "day", true)
            .await
            .with_context(|| format!("Failed to fetch series for {}", ticker))?;

        let snapshot = Self::compute(&candles);

        let mut cache = self.cache.lock().await;
        cache.insert(ticker.to_string(), (snapshot.clone(), now));
        Ok(snapshot)
    }

    /// Price-cache invalidation for a ticker cascades here.
    pub async fn invalidate(&self, ticker: &str) {
        self.historical.invalidate(ticker).await;
        let mut cache = self.cache.lock().await;
        if cache.remove(ticker).is_some() {
            debug!("IndicatorService: Invalidated cache for {}", ticker);
        }
    }

    fn compute(candles: &[Candle]) -> IndicatorSnapshot {
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();

        let avg_volume = if candles.is_empty() {
            None
        } else {
            let tail: Vec<&Candle> = candles
                .iter()
                .rev()
                .take(AVG_VOLUME_WINDOW)
                .collect();
            let sum: Decimal = tail.iter().map(|c| c.volume).sum();
            Some(sum / Decimal::from(tail.len() as u64))
        };

        IndicatorSnapshot {
            close: closes.last().copied(),
            rsi: Self::rsi(&closes, 14),
            ema9: Self::ema(&closes, 9),
            ema200: Self::ema(&closes, 200),
            avg_volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_series(value: Decimal, len: usize) -> Vec<Decimal> {
        vec![value; len]
    }

    #[test]
    fn test_ema_of_flat_series_is_the_value() {
        let series = flat_series(dec!(100), 50);
        let ema = IndicatorService::ema(&series, 9).unwrap();
        // EMA of a constant series converges to the constant
        assert!((ema - dec!(100)).abs() < dec!(0.0001));
    }

    #[test]
    fn test_ema_short_series_is_none() {
        let series = flat_series(dec!(100), 5);
        assert!(IndicatorService::ema(&series, 9).is_none());
    }

    #[test]
    fn test_rsi_uptrend_above_70() {
        let series: Vec<Decimal> = (1..=40).map(|i| Decimal::from(100 + i)).collect();
        let rsi = IndicatorService::rsi(&series, 14).unwrap();
        assert!(rsi > dec!(70), "Monotonic uptrend should read overbought, got {}", rsi);
    }

    #[test]
    fn test_rsi_downtrend_below_30() {
        let series: Vec<Decimal> = (1..=40).map(|i| Decimal::from(200 - i)).collect();
        let rsi = IndicatorService::rsi(&series, 14).unwrap();
        assert!(rsi < dec!(30), "Monotonic downtrend should read oversold, got {}", rsi);
    }

    #[test]
    fn test_rsi_needs_more_than_period() {
        let series = flat_series(dec!(100), 14);
        assert!(IndicatorService::rsi(&series, 14).is_none());
    }

    #[test]
    fn test_snapshot_compute_on_flat_candles() {
        let candles: Vec<Candle> = (0..250)
            .map(|i| Candle {
                ticker: "ACME".to_string(),
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100),
                volume: dec!(10000),
                timestamp: 1_700_000_000 + i * 86_400,
            })
            .collect();

        let snapshot = IndicatorService::compute(&candles);
        assert_eq!(snapshot.close, Some(dec!(100)));
        assert_eq!(snapshot.avg_volume, Some(dec!(10000)));
        assert!(snapshot.ema9.is_some());
        assert!(snapshot.ema200.is_some());
        assert!(snapshot.is_complete());
    }
}
