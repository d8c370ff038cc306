//! Live and historical market data: LTP cache, deduplicated
//! subscriptions, and the cached historical-series service.

pub mod historical;
pub mod price_cache;
pub mod subscription_manager;

pub use historical::HistoricalService;
pub use price_cache::LtpCache;
pub use subscription_manager::SubscriptionManager;

use crate::domain::market_calendar::MarketCalendar;
use crate::domain::types::{Position, QuotedPrice, Recommendation};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Facade over the market-data leaves, wired once per process by the
/// supervisor and torn down with it.
pub struct MarketDataService {
    pub cache: Arc<LtpCache>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub historical: Arc<HistoricalService>,
    calendar: MarketCalendar,
    max_staleness_market: Duration,
    max_staleness_offhours: Duration,
}

impl MarketDataService {
    pub fn new(
        cache: Arc<LtpCache>,
        subscriptions: Arc<SubscriptionManager>,
        historical: Arc<HistoricalService>,
        calendar: MarketCalendar,
        max_staleness_market: Duration,
        max_staleness_offhours: Duration,
    ) -> Self {
        Self {
            cache,
            subscriptions,
            historical,
            calendar,
            max_staleness_market,
            max_staleness_offhours,
        }
    }

    fn staleness_bound(&self) -> Duration {
        if self.calendar.is_market_open(Utc::now()) {
            self.max_staleness_market
        } else {
            self.max_staleness_offhours
        }
    }

    /// Freshest price for a symbol. Falls back to the latest historical
    /// close (stale-marked) when the symbol has never been observed live.
    pub async fn realtime_price(&self, symbol: &str, ticker: &str) -> Option<QuotedPrice> {
        let now = Utc::now();
        if let Some(quote) = self.cache.realtime(symbol, now, self.staleness_bound()) {
            return Some(quote);
        }

        let (close, bar_time) = self.historical.latest_close(ticker).await?;
        debug!("MarketDataService: {} not in live cache, using historical close", symbol);
        self.cache.seed_historical(symbol.to_string(), close, bar_time);
        Some(QuotedPrice {
            price: close,
            as_of: bar_time,
            stale: true,
        })
    }

    /// Best-effort pre-fetch of historicals plus live subscriptions for
    /// open positions; failures are logged, never fatal.
    pub async fn warm_for_positions(&self, positions: &[Position], service_id: &str) {
        let symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        self.warm(&symbols, service_id).await;
    }

    pub async fn warm_for_recommendations(&self, recs: &[Recommendation], service_id: &str) {
        let symbols: Vec<String> = recs.iter().map(|r| r.symbol.clone()).collect();
        self.warm(&symbols, service_id).await;
    }

    async fn warm(&self, symbols: &[String], service_id: &str) {
        if symbols.is_empty() {
            return;
        }
        info!("MarketDataService: Warming cache for {} symbols", symbols.len());

        if let Err(e) = self.subscriptions.subscribe(symbols, service_id).await {
            tracing::warn!("MarketDataService: Warm subscribe failed: {}", e);
        }

        for symbol in symbols {
            if let Err(e) = self.historical.series(symbol, 250, "day", false).await {
                debug!("MarketDataService: Warm fetch failed for {}: {}", symbol, e);
            }
        }
    }
}
