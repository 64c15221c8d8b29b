// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job cadences, evaluated in UTC.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, measured from the previous tick
    Every(Duration),
    /// Once a day at a wall-clock time
    DailyAt(NaiveTime),
    /// Once a week on a given day
    WeeklyAt(Weekday, NaiveTime),
    /// Never fires on its own; trigger only
    Manual,
}

impl Schedule {
    /// The first firing strictly after `now`. `None` for manual jobs.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Schedule::Every(period) => {
                let period = chrono::Duration::from_std(period).ok()?;
                if period <= chrono::Duration::zero() {
                    return None;
                }
                Some(now + period)
            }
            Schedule::DailyAt(at) => {
                let today = now.date_naive().and_time(at).and_utc();
                if today > now {
                    Some(today)
                } else {
                    Some(today.checked_add_days(Days::new(1))?)
                }
            }
            Schedule::WeeklyAt(day, at) => {
                let today = now.date_naive();
                let ahead = (7 + day.num_days_from_monday() as i64
                    - today.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = today
                    .checked_add_days(Days::new(ahead as u64))?
                    .and_time(at)
                    .and_utc();
                if candidate > now {
                    Some(candidate)
                } else {
                    Some(candidate.checked_add_days(Days::new(7))?)
                }
            }
            Schedule::Manual => None,
        }
    }

    /// Time from `now` until the next firing.
    #[must_use]
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        (next - now).to_std().ok()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Every(d) => write!(f, "every {}s", d.as_secs()),
            Schedule::DailyAt(t) => write!(f, "daily at {}", t.format("%H:%M")),
            Schedule::WeeklyAt(d, t) => write!(f, "weekly on {} at {}", d, t.format("%H:%M")),
            Schedule::Manual => f.write_str("manual"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_every() {
        let s = Schedule::Every(Duration::from_secs(300));
        assert_eq!(s.next_after(at(2026, 3, 1, 10, 0)), Some(at(2026, 3, 1, 10, 5)));
        assert_eq!(Schedule::Every(Duration::ZERO).next_after(at(2026, 3, 1, 10, 0)), None);
    }

    #[test]
    fn test_daily_before_and_after() {
        let s = Schedule::DailyAt(time(2, 0));
        assert_eq!(s.next_after(at(2026, 3, 1, 1, 0)), Some(at(2026, 3, 1, 2, 0)));
        assert_eq!(s.next_after(at(2026, 3, 1, 2, 0)), Some(at(2026, 3, 2, 2, 0)));
        assert_eq!(s.next_after(at(2026, 3, 31, 23, 0)), Some(at(2026, 4, 1, 2, 0)));
    }

    #[test]
    fn test_weekly() {
        // 2026-03-01 is a Sunday
        let s = Schedule::WeeklyAt(Weekday::Sun, time(4, 0));
        assert_eq!(s.next_after(at(2026, 3, 1, 3, 0)), Some(at(2026, 3, 1, 4, 0)));
        assert_eq!(s.next_after(at(2026, 3, 1, 5, 0)), Some(at(2026, 3, 8, 4, 0)));
        assert_eq!(s.next_after(at(2026, 3, 4, 12, 0)), Some(at(2026, 3, 8, 4, 0)));
    }

    #[test]
    fn test_manual_never_fires() {
        assert_eq!(Schedule::Manual.next_after(at(2026, 1, 1, 0, 0)), None);
        assert_eq!(Schedule::Manual.delay_from(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_delay_from() {
        let s = Schedule::DailyAt(time(2, 0));
        assert_eq!(s.delay_from(at(2026, 3, 1, 1, 30)), Some(Duration::from_secs(1800)));
    }
}
