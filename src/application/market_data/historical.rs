use crate::domain::errors::BrokerError;
use crate::domain::market_calendar::MarketCalendar;
use crate::domain::ports::BrokerAdapter;
use crate::domain::types::Candle;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct SeriesKey {
    ticker: String,
    days: u32,
    interval: String,
    include_today: bool,
}

struct CachedSeries {
    candles: Vec<Candle>,
    fetched_at: DateTime<Utc>,
}

/// Historical-series cache in front of the broker's candle endpoint.
///
/// TTL adapts to the session: short during market hours, long outside.
/// A series arriving with out-of-sequence timestamps invalidates its cache
/// entry instead of being stored.
pub struct HistoricalService {
    broker: Arc<dyn BrokerAdapter>,
    calendar: MarketCalendar,
    ttl_market: Duration,
    ttl_offhours: Duration,
    cache: Mutex<HashMap<SeriesKey, CachedSeries>>,
}

impl HistoricalService {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        calendar: MarketCalendar,
        ttl_market: Duration,
        ttl_offhours: Duration,
    ) -> Self {
        Self {
            broker,
            calendar,
            ttl_market,
            ttl_offhours,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn ttl_at(&self, now: DateTime<Utc>) -> Duration {
        if self.calendar.is_market_open(now) {
            self.ttl_market
        } else {
            self.ttl_offhours
        }
    }

    pub async fn series(
        &self,
        ticker: &str,
        days: u32,
        interval: &str,
        include_today: bool,
    ) -> Result<Vec<Candle>, BrokerError> {
        let key = SeriesKey {
            ticker: ticker.to_string(),
            days,
            interval: interval.to_string(),
            include_today,
        };
        let now = Utc::now();
        let ttl = self.ttl_at(now);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                let age = (now - entry.fetched_at).to_std().unwrap_or_default();
                if age <= ttl {
                    debug!("HistoricalService: Cache hit for {} ({}d/{})", ticker, days, interval);
                    return Ok(entry.candles.clone());
                }
            }
        }

        let candles = self
            .broker
            .historical_candles(ticker, days, interval, include_today)
            .await?;

        let in_sequence = candles.windows(2).all(|w| w[0].timestamp <= w[1].timestamp);

        let mut cache = self.cache.lock().await;
        if in_sequence {
            cache.insert(
                key,
                CachedSeries {
                    candles: candles.clone(),
                    fetched_at: now,
                },
            );
        } else {
            warn!(
                "HistoricalService: Out-of-sequence timestamps for {}, cache entry invalidated",
                ticker
            );
            cache.remove(&key);
        }

        Ok(candles)
    }

    /// Close and bar time of the most recent daily candle, the fallback
    /// price when a symbol has no live subscription.
    pub async fn latest_close(&self, ticker: &str) -> Option<(Decimal, DateTime<Utc>)> {
        let candles = match self.series(ticker, 5, "day", true).await {
            Ok(c) => c,
            Err(e) => {
                debug!("HistoricalService: latest_close fetch failed for {}: {}", ticker, e);
                return None;
            }
        };
        let last = candles.last()?;
        let bar_time = DateTime::from_timestamp(last.timestamp, 0)?;
        Some((last.close, bar_time))
    }

    /// Drop every cached series for a ticker (price-cache invalidation
    /// cascades here).
    pub async fn invalidate(&self, ticker: &str) {
        let mut cache = self.cache.lock().await;
        cache.retain(|k, _| k.ticker != ticker);
    }
}
