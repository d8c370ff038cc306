use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use std::collections::BTreeSet;

/// Trading-session calendar: market timezone, open/close times and the
/// configured holiday list. Weekends are always non-trading.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(
        offset: FixedOffset,
        open: NaiveTime,
        close: NaiveTime,
        holidays: Vec<NaiveDate>,
    ) -> Self {
        Self {
            offset,
            open,
            close,
            holidays: holidays.into_iter().collect(),
        }
    }

    /// NSE-style defaults: IST (+05:30), 09:15 - 15:30, no holidays.
    pub fn default_equity() -> Self {
        Self::new(
            FixedOffset::east_opt(5 * 3600 + 1800).expect("valid offset"),
            NaiveTime::from_hms_opt(9, 15, 0).expect("valid time"),
            NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
            Vec::new(),
        )
    }

    pub fn market_open(&self) -> NaiveTime {
        self.open
    }

    pub fn market_close(&self) -> NaiveTime {
        self.close
    }

    pub fn to_local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Inside the open..=close window on a trading day.
    pub fn is_market_open(&self, at: DateTime<Utc>) -> bool {
        let local = self.to_local(at);
        let date = local.date_naive();
        if !self.is_trading_day(date) {
            return false;
        }
        let time = local.time();
        time >= self.open && time <= self.close
    }

    /// Nearest trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_day(d) {
            d += Duration::days(1);
        }
        d
    }

    /// Market close (local) of the next trading day after the reference
    /// instant, skipping weekends and holidays. This is the retry expiry
    /// deadline for failed orders.
    pub fn next_trading_day_close(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = self.to_local(after).date_naive();
        let next = self.next_trading_day(local_date);
        let close_local = self
            .offset
            .from_local_datetime(&next.and_time(self.close))
            .single()
            .expect("fixed offsets are unambiguous");
        close_local.with_timezone(&Utc)
    }

    /// The next instant at which `time` (local) occurs on a trading day,
    /// at or after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let local = self.to_local(after);
        let mut date = local.date_naive();
        if !self.is_trading_day(date) || local.time() > time {
            date = self.next_trading_day(date);
        }
        while !self.is_trading_day(date) {
            date = self.next_trading_day(date);
        }
        let at_local = self
            .offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .expect("fixed offsets are unambiguous");
        at_local.with_timezone(&Utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar_with_holiday(holiday: &str) -> MarketCalendar {
        MarketCalendar::new(
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            vec![NaiveDate::parse_from_str(holiday, "%Y-%m-%d").unwrap()],
        )
    }

    fn utc_from_ist(date: &str, time: &str) -> DateTime<Utc> {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let naive = format!("{} {}", date, time);
        let local = chrono::NaiveDateTime::parse_from_str(&naive, "%Y-%m-%d %H:%M:%S").unwrap();
        offset
            .from_local_datetime(&local)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_weekend_is_not_trading_day() {
        let cal = MarketCalendar::default_equity();
        // 2025-06-14 is a Saturday
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()));
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()));
        assert!(cal.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 16).unwrap()));
    }

    #[test]
    fn test_market_open_window() {
        let cal = MarketCalendar::default_equity();
        assert!(cal.is_market_open(utc_from_ist("2025-06-16", "09:15:00")));
        assert!(cal.is_market_open(utc_from_ist("2025-06-16", "15:30:00")));
        assert!(!cal.is_market_open(utc_from_ist("2025-06-16", "09:14:59")));
        assert!(!cal.is_market_open(utc_from_ist("2025-06-16", "15:30:01")));
        // Saturday is never open
        assert!(!cal.is_market_open(utc_from_ist("2025-06-14", "10:00:00")));
    }

    #[test]
    fn test_next_trading_day_close_skips_weekend() {
        let cal = MarketCalendar::default_equity();
        // Failed Friday 16:00 IST -> expiry Monday 15:30 IST
        let failed_at = utc_from_ist("2025-06-13", "16:00:00");
        let expiry = cal.next_trading_day_close(failed_at);
        assert_eq!(expiry, utc_from_ist("2025-06-16", "15:30:00"));
    }

    #[test]
    fn test_next_trading_day_close_skips_holiday() {
        // Monday 2025-06-16 configured as a holiday
        let cal = calendar_with_holiday("2025-06-16");
        let failed_at = utc_from_ist("2025-06-13", "16:00:00");
        let expiry = cal.next_trading_day_close(failed_at);
        assert_eq!(expiry, utc_from_ist("2025-06-17", "15:30:00"));
    }

    #[test]
    fn test_next_occurrence_same_day() {
        let cal = MarketCalendar::default_equity();
        let now = utc_from_ist("2025-06-16", "08:00:00");
        let at = cal.next_occurrence(now, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(at, utc_from_ist("2025-06-16", "09:00:00"));
    }

    #[test]
    fn test_next_occurrence_rolls_over_weekend() {
        let cal = MarketCalendar::default_equity();
        // Friday after 16:05 -> next buy_orders trigger is Monday
        let now = utc_from_ist("2025-06-13", "17:00:00");
        let at = cal.next_occurrence(now, NaiveTime::from_hms_opt(16, 5, 0).unwrap());
        assert_eq!(at, utc_from_ist("2025-06-16", "16:05:00"));
    }
}
