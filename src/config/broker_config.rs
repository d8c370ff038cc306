//! Broker connection configuration parsing from environment variables.

use std::env;

/// Broker HTTP/WebSocket endpoints and per-user credentials.
///
/// Multi-user credentials are keyed by user id:
/// `BROKER_API_KEY_<user_id>` / `BROKER_API_SECRET_<user_id>`, with the
/// unsuffixed variables serving as the fallback for single-user setups.
#[derive(Debug, Clone, Default)]
pub struct BrokerEnvConfig {
    pub base_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl BrokerEnvConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| "https://api.broker.example.com".to_string()),
            ws_url: env::var("BROKER_WS_URL")
                .unwrap_or_else(|_| "wss://stream.broker.example.com/ltp".to_string()),
            api_key: env::var("BROKER_API_KEY").unwrap_or_default(),
            api_secret: env::var("BROKER_API_SECRET").unwrap_or_default(),
        }
    }

    pub fn credentials_for_user(&self, user_id: i64) -> (String, String) {
        let key = env::var(format!("BROKER_API_KEY_{}", user_id))
            .unwrap_or_else(|_| self.api_key.clone());
        let secret = env::var(format!("BROKER_API_SECRET_{}", user_id))
            .unwrap_or_else(|_| self.api_secret.clone());
        (key, secret)
    }
}
