use crate::domain::market_calendar::MarketCalendar;
use crate::domain::types::{TaskName, TaskSchedule};
use chrono::{DateTime, NaiveTime, Timelike, Utc};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
}

/// Built-in schedule table, seeded into the schedules store on first run.
/// All times are market-local.
pub fn default_schedules() -> Vec<TaskSchedule> {
    vec![
        TaskSchedule {
            task: TaskName::PremarketRetry,
            schedule_time: t(9, 0),
            enabled: true,
            is_hourly: false,
            is_continuous: false,
            end_time: None,
            updated_by: None,
            updated_at: None,
        },
        TaskSchedule {
            task: TaskName::SellMonitor,
            schedule_time: t(9, 15),
            enabled: true,
            is_hourly: false,
            is_continuous: true,
            end_time: Some(t(15, 30)),
            updated_by: None,
            updated_at: None,
        },
        TaskSchedule {
            task: TaskName::PositionMonitor,
            schedule_time: t(9, 30),
            enabled: true,
            is_hourly: true,
            is_continuous: false,
            end_time: Some(t(15, 30)),
            updated_by: None,
            updated_at: None,
        },
        TaskSchedule {
            task: TaskName::Analysis,
            schedule_time: t(16, 0),
            enabled: true,
            is_hourly: false,
            is_continuous: false,
            end_time: None,
            updated_by: None,
            updated_at: None,
        },
        TaskSchedule {
            task: TaskName::BuyOrders,
            schedule_time: t(16, 5),
            enabled: true,
            is_hourly: false,
            is_continuous: false,
            end_time: None,
            updated_by: None,
            updated_at: None,
        },
        TaskSchedule {
            task: TaskName::EodCleanup,
            schedule_time: t(18, 0),
            enabled: true,
            is_hourly: false,
            is_continuous: false,
            end_time: None,
            updated_by: None,
            updated_at: None,
        },
    ]
}

/// Decides whether a task is due at `now`, given when it last fired.
/// Continuous tasks tick at `tick_interval_secs` strictly within their
/// market-hours window; hourly tasks fire once per hour at the schedule's
/// minute; one-shots fire once per trading day at or after their time.
pub fn is_due(
    schedule: &TaskSchedule,
    calendar: &MarketCalendar,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    tick_interval_secs: u64,
) -> bool {
    if !schedule.enabled {
        return false;
    }

    let local = calendar.to_local(now);
    if !calendar.is_trading_day(local.date_naive()) {
        return false;
    }
    let time = local.time();

    if schedule.is_continuous {
        let end = schedule.end_time.unwrap_or_else(|| calendar.market_close());
        if time < schedule.schedule_time || time > end {
            return false;
        }
        return match last_fired {
            Some(last) => (now - last).num_seconds() >= tick_interval_secs as i64,
            None => true,
        };
    }

    if schedule.is_hourly {
        let end = schedule.end_time.unwrap_or_else(|| calendar.market_close());
        if time < schedule.schedule_time || time > end {
            return false;
        }
        if time.minute() != schedule.schedule_time.minute() {
            return false;
        }
        return match last_fired {
            Some(last) => {
                let last_local = calendar.to_local(last);
                last_local.date_naive() != local.date_naive()
                    || last_local.hour() != local.hour()
            }
            None => true,
        };
    }

    // One-shot: at or after the scheduled time, once per day
    if time < schedule.schedule_time {
        return false;
    }
    match last_fired {
        Some(last) => calendar.to_local(last).date_naive() != local.date_naive(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn cal() -> MarketCalendar {
        MarketCalendar::default_equity()
    }

    fn ist(date: &str, time: &str) -> DateTime<Utc> {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let naive = chrono::NaiveDateTime::parse_from_str(
            &format!("{} {}", date, time),
            "%Y-%m-%d %H:%M:%S",
        )
        .unwrap();
        offset
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn schedule_for(task: TaskName) -> TaskSchedule {
        default_schedules()
            .into_iter()
            .find(|s| s.task == task)
            .unwrap()
    }

    #[test]
    fn test_one_shot_fires_once_per_day() {
        let s = schedule_for(TaskName::PremarketRetry);
        // Monday 2025-06-16
        assert!(is_due(&s, &cal(), ist("2025-06-16", "09:00:10"), None, 60));

        let fired = ist("2025-06-16", "09:00:10");
        assert!(!is_due(
            &s,
            &cal(),
            ist("2025-06-16", "11:00:00"),
            Some(fired),
            60
        ));
        // Next day it fires again
        assert!(is_due(
            &s,
            &cal(),
            ist("2025-06-17", "09:00:10"),
            Some(fired),
            60
        ));
    }

    #[test]
    fn test_one_shot_not_before_time() {
        let s = schedule_for(TaskName::BuyOrders);
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "16:04:59"), None, 60));
        assert!(is_due(&s, &cal(), ist("2025-06-16", "16:05:01"), None, 60));
    }

    #[test]
    fn test_continuous_respects_market_window() {
        let s = schedule_for(TaskName::SellMonitor);
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "09:14:00"), None, 60));
        assert!(is_due(&s, &cal(), ist("2025-06-16", "09:15:00"), None, 60));
        // Strictly after close: no ticks
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "15:30:01"), None, 60));
    }

    #[test]
    fn test_continuous_tick_interval() {
        let s = schedule_for(TaskName::SellMonitor);
        let fired = ist("2025-06-16", "10:00:00");
        assert!(!is_due(
            &s,
            &cal(),
            ist("2025-06-16", "10:00:30"),
            Some(fired),
            60
        ));
        assert!(is_due(
            &s,
            &cal(),
            ist("2025-06-16", "10:01:00"),
            Some(fired),
            60
        ));
    }

    #[test]
    fn test_continuous_skips_weekend() {
        let s = schedule_for(TaskName::SellMonitor);
        // Saturday
        assert!(!is_due(&s, &cal(), ist("2025-06-14", "10:00:00"), None, 60));
    }

    #[test]
    fn test_hourly_fires_at_minute_once_per_hour() {
        let s = schedule_for(TaskName::PositionMonitor);
        assert!(is_due(&s, &cal(), ist("2025-06-16", "10:30:15"), None, 60));

        let fired = ist("2025-06-16", "10:30:15");
        // Same hour: no second firing
        assert!(!is_due(
            &s,
            &cal(),
            ist("2025-06-16", "10:30:45"),
            Some(fired),
            60
        ));
        // Next hour at :30
        assert!(is_due(
            &s,
            &cal(),
            ist("2025-06-16", "11:30:05"),
            Some(fired),
            60
        ));
        // Not at :31
        assert!(!is_due(
            &s,
            &cal(),
            ist("2025-06-16", "11:31:05"),
            Some(fired),
            60
        ));
    }

    #[test]
    fn test_hourly_respects_window() {
        let s = schedule_for(TaskName::PositionMonitor);
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "08:30:00"), None, 60));
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "16:30:00"), None, 60));
    }

    #[test]
    fn test_disabled_schedule_never_due() {
        let mut s = schedule_for(TaskName::PremarketRetry);
        s.enabled = false;
        assert!(!is_due(&s, &cal(), ist("2025-06-16", "09:00:10"), None, 60));
    }
}
