//! Supervisor tuning knobs parsed from environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SupervisorEnvConfig {
    pub monitor_interval_seconds: u64,
    /// Clamped to [10, 30] on load.
    pub place_verify_delay_seconds: u64,
    pub max_portfolio_size: usize,
    pub capital_per_trade: Decimal,
    pub min_qty: Decimal,
    pub max_staleness_seconds: u64,
    pub max_staleness_offhours_seconds: u64,
    pub notify_per_minute: u32,
    pub notify_per_hour: u32,
    pub stop_grace_period_seconds: u64,
    pub run_once_deadline_seconds: u64,
    pub broker_call_timeout_seconds: u64,
    pub historical_ttl_market_seconds: u64,
    pub historical_ttl_offhours_seconds: u64,
}

impl SupervisorEnvConfig {
    pub fn from_env() -> Result<Self> {
        let raw_verify_delay = parse_u64("PLACE_VERIFY_DELAY_SECONDS", 15)?;

        Ok(Self {
            monitor_interval_seconds: parse_u64("MONITOR_INTERVAL_SECONDS", 60)?,
            place_verify_delay_seconds: raw_verify_delay.clamp(10, 30),
            max_portfolio_size: parse_usize("MAX_PORTFOLIO_SIZE", 6)?,
            capital_per_trade: parse_decimal("CAPITAL_PER_TRADE", "25000")?,
            min_qty: parse_decimal("MIN_QTY", "1")?,
            max_staleness_seconds: parse_u64("MAX_STALENESS_SECONDS", 30)?,
            max_staleness_offhours_seconds: parse_u64("MAX_STALENESS_OFFHOURS_SECONDS", 300)?,
            notify_per_minute: parse_u32("NOTIFY_PER_MINUTE", 10)?,
            notify_per_hour: parse_u32("NOTIFY_PER_HOUR", 100)?,
            stop_grace_period_seconds: parse_u64("STOP_GRACE_PERIOD_SECONDS", 30)?,
            run_once_deadline_seconds: parse_u64("RUN_ONCE_DEADLINE_SECONDS", 300)?,
            broker_call_timeout_seconds: parse_u64("BROKER_CALL_TIMEOUT_SECONDS", 15)?,
            historical_ttl_market_seconds: parse_u64("HISTORICAL_TTL_MARKET_SECONDS", 60)?,
            historical_ttl_offhours_seconds: parse_u64("HISTORICAL_TTL_OFFHOURS_SECONDS", 21600)?,
        })
    }
}

fn parse_u64(key: &str, default: u64) -> Result<u64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .context(format!("Failed to parse {}", key))
}

fn parse_u32(key: &str, default: u32) -> Result<u32> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u32>()
        .context(format!("Failed to parse {}", key))
}

fn parse_usize(key: &str, default: usize) -> Result<usize> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<usize>()
        .context(format!("Failed to parse {}", key))
}

fn parse_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw).context(format!("Failed to parse {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_delay_clamped() {
        // SAFETY: test-local env mutation, no parallel readers of this key
        unsafe {
            env::set_var("PLACE_VERIFY_DELAY_SECONDS", "5");
        }
        let config = SupervisorEnvConfig::from_env().unwrap();
        assert_eq!(config.place_verify_delay_seconds, 10);

        unsafe {
            env::set_var("PLACE_VERIFY_DELAY_SECONDS", "90");
        }
        let config = SupervisorEnvConfig::from_env().unwrap();
        assert_eq!(config.place_verify_delay_seconds, 30);

        unsafe {
            env::remove_var("PLACE_VERIFY_DELAY_SECONDS");
        }
    }
}
