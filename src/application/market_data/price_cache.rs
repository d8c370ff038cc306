use crate::domain::types::{PriceObservation, PriceSource, QuotedPrice};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Last-traded-price cache fed by the WebSocket callback.
///
/// Observations carry no TTL of their own; staleness is decided at read
/// time against the caller-supplied bound. Single writer per symbol (the
/// stream callback), many readers.
pub struct LtpCache {
    observations: RwLock<HashMap<String, PriceObservation>>,
}

impl std::fmt::Debug for LtpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LtpCache")
            .field("observations", &"<RwLock>")
            .finish()
    }
}

impl LtpCache {
    pub fn new() -> Self {
        Self {
            observations: RwLock::new(HashMap::new()),
        }
    }

    /// Store the latest observation for a symbol. Older ticks arriving out
    /// of order are dropped.
    pub fn update(&self, symbol: String, ltp: Decimal, received_at: DateTime<Utc>) {
        self.store(PriceObservation {
            symbol,
            ltp,
            received_at,
            source: PriceSource::Websocket,
        });
    }

    /// Seed from a historical bar close; read back as stale.
    pub fn seed_historical(&self, symbol: String, close: Decimal, bar_time: DateTime<Utc>) {
        self.store(PriceObservation {
            symbol,
            ltp: close,
            received_at: bar_time,
            source: PriceSource::Historical,
        });
    }

    fn store(&self, obs: PriceObservation) {
        let mut guard = match self.observations.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::error!("LtpCache: Lock poisoned during write, recovering");
                poisoned.into_inner()
            }
        };
        match guard.get(&obs.symbol) {
            Some(existing) if existing.received_at > obs.received_at => {}
            _ => {
                guard.insert(obs.symbol.clone(), obs);
            }
        }
    }

    /// Freshest observation for the symbol, or None if never observed.
    /// `max_staleness` marks (not hides) observations past the bound, and
    /// historical seeds are always marked stale.
    pub fn realtime(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        max_staleness: Duration,
    ) -> Option<QuotedPrice> {
        let guard = match self.observations.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let obs = guard.get(symbol)?;

        let age = (now - obs.received_at).to_std().unwrap_or_default();
        let stale = obs.source == PriceSource::Historical || age > max_staleness;

        Some(QuotedPrice {
            price: obs.ltp,
            as_of: obs.received_at,
            stale,
        })
    }

    pub fn clear(&self) {
        match self.observations.write() {
            Ok(mut g) => g.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl Default for LtpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fresh_lookup() {
        let cache = LtpCache::new();
        let now = Utc::now();
        cache.update("ACME".to_string(), dec!(2500.50), now);

        let quote = cache
            .realtime("ACME", now, Duration::from_secs(30))
            .unwrap();
        assert_eq!(quote.price, dec!(2500.50));
        assert!(!quote.stale);
    }

    #[test]
    fn test_stale_past_bound() {
        let cache = LtpCache::new();
        let observed = Utc::now() - chrono::Duration::seconds(120);
        cache.update("ACME".to_string(), dec!(2500), observed);

        let quote = cache
            .realtime("ACME", Utc::now(), Duration::from_secs(30))
            .unwrap();
        assert!(quote.stale);
    }

    #[test]
    fn test_never_observed_is_none() {
        let cache = LtpCache::new();
        assert!(
            cache
                .realtime("UNKNOWN", Utc::now(), Duration::from_secs(30))
                .is_none()
        );
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let cache = LtpCache::new();
        let now = Utc::now();
        cache.update("ACME".to_string(), dec!(2510), now);
        cache.update("ACME".to_string(), dec!(2490), now - chrono::Duration::seconds(5));

        let quote = cache
            .realtime("ACME", now, Duration::from_secs(30))
            .unwrap();
        assert_eq!(quote.price, dec!(2510));
    }

    #[test]
    fn test_historical_seed_marked_stale() {
        let cache = LtpCache::new();
        let now = Utc::now();
        cache.seed_historical("ACME".to_string(), dec!(2488), now);

        let quote = cache
            .realtime("ACME", now, Duration::from_secs(30))
            .unwrap();
        assert!(quote.stale);
        assert_eq!(quote.price, dec!(2488));
    }
}
