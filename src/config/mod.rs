//! Configuration module for Tradewarden.
//!
//! Structured configuration loading from environment variables, organized
//! by domain: Broker, Market session, and Supervisor tuning.

mod broker_config;
mod market_config;
mod supervisor_config;

pub use broker_config::BrokerEnvConfig;
pub use market_config::MarketEnvConfig;
pub use supervisor_config::SupervisorEnvConfig;

use crate::domain::market_calendar::MarketCalendar;
use anyhow::{Context, Result};
use std::env;

/// Main application configuration aggregating all sub-configs.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_bind_address: String,
    pub admin_token: Option<String>,
    /// Users the supervisor manages at startup.
    pub user_ids: Vec<i64>,
    pub broker: BrokerEnvConfig,
    pub market: MarketEnvConfig,
    pub supervisor: SupervisorEnvConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/tradewarden.db".to_string());

        let api_bind_address =
            env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8700".to_string());

        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());

        let users_str = env::var("USER_IDS").unwrap_or_else(|_| "1".to_string());
        let mut user_ids = Vec::new();
        for entry in users_str.split(',') {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let id: i64 = trimmed
                .parse()
                .with_context(|| format!("Failed to parse USER_IDS entry: {}", trimmed))?;
            user_ids.push(id);
        }

        Ok(Self {
            database_url,
            api_bind_address,
            admin_token,
            user_ids,
            broker: BrokerEnvConfig::from_env(),
            market: MarketEnvConfig::from_env().context("Failed to load market config")?,
            supervisor: SupervisorEnvConfig::from_env()
                .context("Failed to load supervisor config")?,
        })
    }

    pub fn market_calendar(&self) -> MarketCalendar {
        MarketCalendar::new(
            self.market.timezone_offset,
            self.market.market_open,
            self.market.market_close,
            self.market.holidays.clone(),
        )
    }
}
