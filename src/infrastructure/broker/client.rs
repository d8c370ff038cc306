use super::wire::{WireCandle, WireHolding, WireLimits, WireOrder, WirePlacement, WireSession};
use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    AccountLimits, BrokerAdapter, HoldingsSnapshot, OrderBookSnapshot, OrderChanges, OrderRequest,
    PlacementReceipt,
};
use crate::domain::types::{BrokerOrderState, Candle};
use async_trait::async_trait;
use chrono::Utc;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

/// One authenticated REST session per user.
///
/// Session expiry (HTTP 401) triggers a single serialized re-login and one
/// retry of the failing call; concurrent callers wait on the in-flight
/// refresh instead of stampeding the login endpoint.
pub struct HttpBrokerAdapter {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    api_secret: String,
    user_id: i64,
    call_timeout: Duration,
    access_token: Mutex<Option<String>>,
}

enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpBrokerAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        user_id: i64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client: Self::build_session_client(call_timeout),
            base_url,
            api_key,
            api_secret,
            user_id,
            call_timeout,
            access_token: Mutex::new(None),
        }
    }

    /// One retried HTTP client per broker session. Transient failures get
    /// up to 3 attempts with jittered exponential backoff; the pool is
    /// kept small because the broker caps connections per session.
    fn build_session_client(call_timeout: Duration) -> ClientWithMiddleware {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .timeout(call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }

    fn login_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(self.api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn login(&self) -> Result<String, BrokerError> {
        let url = format!("{}/session/login", self.base_url);
        let body = serde_json::json!({
            "api_key": self.api_key,
            "checksum": self.login_checksum(),
        });

        let response = tokio::time::timeout(
            self.call_timeout,
            self.client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.to_string())
                .send(),
        )
        .await
        .map_err(|_| BrokerError::Timeout {
            seconds: self.call_timeout.as_secs(),
        })?
        .map_err(|e| BrokerError::Transient {
            reason: format!("login transport error: {}", e),
        })?;

        if !response.status().is_success() {
            return Err(BrokerError::AuthFailed {
                reason: format!("login returned HTTP {}", response.status()),
            });
        }

        let session: WireSession = response.json().await.map_err(|e| BrokerError::Transient {
            reason: format!("login decode error: {}", e),
        })?;

        info!("HttpBrokerAdapter: Session established for user {}", self.user_id);
        Ok(session.access_token)
    }

    async fn current_token(&self) -> Result<String, BrokerError> {
        let mut guard = self.access_token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Serialized refresh: whoever holds the lock logs in; callers that
    /// were waiting see the already-refreshed token and skip the login.
    async fn refresh_token(&self, stale: &str) -> Result<String, BrokerError> {
        let mut guard = self.access_token.lock().await;
        if let Some(current) = guard.as_ref()
            && current != stale
        {
            return Ok(current.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        info!("HttpBrokerAdapter: Session refreshed for user {}", self.user_id);
        Ok(token)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value, BrokerError> {
        let auth = format!("token {}:{}", self.api_key, token);
        let builder = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        }
        .header("Authorization", auth);

        let builder = match body {
            Some(b) => builder
                .header("Content-Type", "application/json")
                .body(b.to_string()),
            None => builder,
        };

        let response = tokio::time::timeout(self.call_timeout, builder.send())
            .await
            .map_err(|_| BrokerError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })?
            .map_err(|e| BrokerError::Transient {
                reason: format!("transport error: {}", e),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| BrokerError::Transient {
            reason: format!("body read error: {}", e),
        })?;

        if status.as_u16() == 401 {
            return Err(BrokerError::SessionExpired);
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(BrokerError::Transient {
                reason: format!("HTTP {}: {}", status, text),
            });
        }
        if !status.is_success() {
            return Err(BrokerError::InvalidRequest {
                reason: format!("HTTP {}: {}", status, text),
            });
        }

        serde_json::from_str(&text).map_err(|e| BrokerError::Transient {
            reason: format!("decode error: {} (body: {})", e, text),
        })
    }

    /// One request with the session-expiry protocol: on 401, refresh once
    /// and retry once.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError> {
        let token = self.current_token().await?;
        match self.send_once(&method, url, body.as_ref(), &token).await {
            Err(BrokerError::SessionExpired) => {
                warn!(
                    "HttpBrokerAdapter: Session expired for user {}, re-authenticating",
                    self.user_id
                );
                let fresh = self.refresh_token(&token).await?;
                self.send_once(&method, url, body.as_ref(), &fresh).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl BrokerAdapter for HttpBrokerAdapter {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacementReceipt, BrokerError> {
        let url = format!("{}/orders", self.base_url);
        let body = serde_json::json!({
            "tradingsymbol": req.symbol,
            "transaction_type": req.side.to_string(),
            "order_type": req.order_type.to_string(),
            "variety": req.variety.to_string(),
            "quantity": req.quantity,
            "price": req.price,
            "tag": req.tag,
        });

        let value = self.request(Method::Post, &url, Some(body)).await?;
        let placement: WirePlacement =
            serde_json::from_value(value).map_err(|e| BrokerError::Transient {
                reason: format!("placement decode error: {}", e),
            })?;

        let immediate_state = placement.status.as_deref().map(|s| {
            super::wire::map_state(
                s,
                rust_decimal::Decimal::ZERO,
                req.quantity,
                None,
                placement.status_message.as_deref(),
            )
        });

        if let Some(BrokerOrderState::Rejected { reason }) = &immediate_state {
            return Err(BrokerError::Rejected {
                reason: reason.clone(),
            });
        }

        Ok(PlacementReceipt {
            local_ack_id: req.tag.clone(),
            broker_order_id: placement.order_id,
            immediate_state,
        })
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, broker_order_id);
        let body = serde_json::json!({
            "price": changes.price,
            "quantity": changes.quantity,
        });
        self.request(Method::Put, &url, Some(body)).await?;
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, broker_order_id);
        self.request(Method::Delete, &url, None).await?;
        Ok(())
    }

    async fn list_orders(&self) -> Result<OrderBookSnapshot, BrokerError> {
        let url = format!("{}/orders", self.base_url);
        let value = self.request(Method::Get, &url, None).await?;
        let wire: Vec<WireOrder> =
            serde_json::from_value(value).map_err(|e| BrokerError::Transient {
                reason: format!("order book decode error: {}", e),
            })?;

        Ok(OrderBookSnapshot {
            entries: wire.into_iter().map(WireOrder::into_entry).collect(),
            fetched_at: Utc::now(),
        })
    }

    async fn list_holdings(&self) -> Result<HoldingsSnapshot, BrokerError> {
        let url = format!("{}/holdings", self.base_url);
        let value = self.request(Method::Get, &url, None).await?;
        let wire: Vec<WireHolding> =
            serde_json::from_value(value).map_err(|e| BrokerError::Transient {
                reason: format!("holdings decode error: {}", e),
            })?;

        Ok(HoldingsSnapshot {
            holdings: wire.into_iter().map(WireHolding::into_holding).collect(),
            fetched_at: Utc::now(),
        })
    }

    async fn get_limits(&self) -> Result<AccountLimits, BrokerError> {
        let url = format!("{}/limits", self.base_url);
        let value = self.request(Method::Get, &url, None).await?;
        let wire: WireLimits =
            serde_json::from_value(value).map_err(|e| BrokerError::Transient {
                reason: format!("limits decode error: {}", e),
            })?;

        Ok(AccountLimits {
            available_cash: rust_decimal::Decimal::from_f64_retain(wire.available_cash)
                .unwrap_or_default(),
        })
    }

    async fn historical_candles(
        &self,
        ticker: &str,
        days: u32,
        interval: &str,
        include_today: bool,
    ) -> Result<Vec<Candle>, BrokerError> {
        let url = self.candles_url(ticker, days, interval, include_today)?;
        let value = self.request(Method::Get, url.as_str(), None).await?;
        let wire: Vec<WireCandle> =
            serde_json::from_value(value).map_err(|e| BrokerError::Transient {
                reason: format!("candles decode error: {}", e),
            })?;

        Ok(wire.into_iter().map(|c| c.into_candle(ticker)).collect())
    }
}

impl HttpBrokerAdapter {
    /// Candle endpoint URL. Tickers can carry share-class separators
    /// (`BRK/A`) and exchange suffixes, so the path segment and the query
    /// pairs both go through `Url` rather than string pasting.
    fn candles_url(
        &self,
        ticker: &str,
        days: u32,
        interval: &str,
        include_today: bool,
    ) -> Result<Url, BrokerError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| BrokerError::InvalidRequest {
                reason: format!("bad broker base url {}: {}", self.base_url, e),
            })?;
        url.path_segments_mut()
            .map_err(|_| BrokerError::InvalidRequest {
                reason: format!("broker base url {} cannot take a path", self.base_url),
            })?
            .push("instruments")
            .push(ticker)
            .push("candles");
        url.query_pairs_mut()
            .append_pair("days", &days.to_string())
            .append_pair("interval", interval)
            .append_pair("include_today", if include_today { "true" } else { "false" });
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HttpBrokerAdapter {
        HttpBrokerAdapter::new(
            "https://api.broker.example.com".to_string(),
            "key".to_string(),
            "secret".to_string(),
            1,
            Duration::from_secs(15),
        )
    }

    #[test]
    fn test_candles_url_query_pairs() {
        let url = adapter().candles_url("ACME.NS", 250, "day", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.broker.example.com/instruments/ACME.NS/candles?days=250&interval=day&include_today=false"
        );
    }

    #[test]
    fn test_candles_url_escapes_share_class_separator() {
        let url = adapter().candles_url("BRK/A", 5, "day", true).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.broker.example.com/instruments/BRK%2FA/candles?days=5&interval=day&include_today=true"
        );
    }
}
