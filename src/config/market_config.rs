//! Market session configuration parsing from environment variables.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Market timezone, session window, holiday calendar and exchange tick size.
#[derive(Debug, Clone)]
pub struct MarketEnvConfig {
    pub timezone_offset: FixedOffset,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub holidays: Vec<NaiveDate>,
    pub tick_size: Decimal,
}

impl MarketEnvConfig {
    pub fn from_env() -> Result<Self> {
        let tz = env::var("MARKET_TIMEZONE").unwrap_or_else(|_| "+05:30".to_string());
        let timezone_offset = parse_offset(&tz)
            .with_context(|| format!("Failed to parse MARKET_TIMEZONE: {}", tz))?;

        let open_str = env::var("MARKET_OPEN").unwrap_or_else(|_| "09:15".to_string());
        let market_open = NaiveTime::parse_from_str(&open_str, "%H:%M")
            .with_context(|| format!("Failed to parse MARKET_OPEN: {}", open_str))?;

        let close_str = env::var("MARKET_CLOSE").unwrap_or_else(|_| "15:30".to_string());
        let market_close = NaiveTime::parse_from_str(&close_str, "%H:%M")
            .with_context(|| format!("Failed to parse MARKET_CLOSE: {}", close_str))?;

        let holidays_str = env::var("MARKET_HOLIDAYS").unwrap_or_default();
        let mut holidays = Vec::new();
        for entry in holidays_str.split(',') {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .with_context(|| format!("Failed to parse MARKET_HOLIDAYS entry: {}", trimmed))?;
            holidays.push(date);
        }

        let tick_str = env::var("TICK_SIZE").unwrap_or_else(|_| "0.05".to_string());
        let tick_size = Decimal::from_str(&tick_str)
            .with_context(|| format!("Failed to parse TICK_SIZE: {}", tick_str))?;

        Ok(Self {
            timezone_offset,
            market_open,
            market_close,
            holidays,
            tick_size,
        })
    }
}

/// Accepts `+HH:MM` / `-HH:MM`.
fn parse_offset(s: &str) -> Result<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => (1, s),
    };
    let (h, m) = rest
        .split_once(':')
        .context("Offset must look like +HH:MM")?;
    let hours: i32 = h.parse().context("Bad offset hours")?;
    let minutes: i32 = m.parse().context("Bad offset minutes")?;
    let total = sign * (hours * 3600 + minutes * 60);
    FixedOffset::east_opt(total).context("Offset out of range")
}
