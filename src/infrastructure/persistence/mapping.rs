//! Row-mapping helpers shared by the SQLite repositories. Decimals are
//! stored as TEXT, timestamps as unix seconds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn dec_text(value: &Decimal) -> String {
    value.to_string()
}

pub fn opt_dec_text(value: &Option<Decimal>) -> Option<String> {
    value.as_ref().map(|d| d.to_string())
}

pub fn parse_dec(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap_or_default()
}

pub fn parse_opt_dec(text: Option<String>) -> Option<Decimal> {
    text.and_then(|t| Decimal::from_str(&t).ok())
}

pub fn ts(value: &DateTime<Utc>) -> i64 {
    value.timestamp()
}

pub fn opt_ts(value: &Option<DateTime<Utc>>) -> Option<i64> {
    value.as_ref().map(|v| v.timestamp())
}

pub fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn from_opt_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}
