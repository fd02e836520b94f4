//! Local calendar-day arithmetic.
//!
//! Retention and the daily high/low log both work in whole local days.
//! Days are always advanced through calendar dates, never by adding a fixed
//! 24 hours, so daylight-saving days of 23 or 25 hours are still one day.

use chrono::{Days, Local, NaiveDate, NaiveTime, TimeZone};

use crate::types::Millis;

/// Maps timestamps onto local calendar days.
pub trait DayCalendar: Send + Sync {
    /// Calendar date containing `t`.
    fn date_of(&self, t: Millis) -> NaiveDate;

    /// Timestamp of the first instant of `date`.
    fn start_of_date(&self, date: NaiveDate) -> Millis;

    /// Local midnight of the day containing `t`.
    fn day_start(&self, t: Millis) -> Millis {
        self.start_of_date(self.date_of(t))
    }

    /// Local midnight `days` calendar days after (or before, if negative) the
    /// day containing `t`.
    fn shift_days(&self, t: Millis, days: i64) -> Millis {
        let date = self.date_of(t);
        let shifted = if days >= 0 {
            date.checked_add_days(Days::new(days.unsigned_abs()))
        } else {
            date.checked_sub_days(Days::new(days.unsigned_abs()))
        };
        self.start_of_date(shifted.unwrap_or(date))
    }

    /// Local midnight that starts the day after the one containing `t`.
    fn next_day_start(&self, t: Millis) -> Millis {
        self.shift_days(t, 1)
    }
}

/// [`DayCalendar`] backed by a chrono time zone.
#[derive(Debug, Clone, Default)]
pub struct ZoneCalendar<Tz> {
    tz: Tz,
}

/// Calendar in the host's local time zone.
pub type LocalCalendar = ZoneCalendar<Local>;

impl<Tz: TimeZone> ZoneCalendar<Tz> {
    /// Create a calendar for the given zone.
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl LocalCalendar {
    /// Calendar in the host's local time zone.
    pub fn local() -> Self {
        Self { tz: Local }
    }
}

impl<Tz> DayCalendar for ZoneCalendar<Tz>
where
    Tz: TimeZone + Send + Sync,
{
    fn date_of(&self, t: Millis) -> NaiveDate {
        match self.tz.timestamp_millis_opt(t).single() {
            Some(dt) => dt.date_naive(),
            None => NaiveDate::default(),
        }
    }

    fn start_of_date(&self, date: NaiveDate) -> Millis {
        // Midnight may not exist locally (zones that spring forward at 00:00),
        // in which case the day starts at the first valid hour.
        for hour in 0..24 {
            let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
                continue;
            };
            if let Some(dt) = self.tz.from_local_datetime(&date.and_time(time)).earliest() {
                return dt.timestamp_millis();
            }
        }
        date.and_hms_opt(0, 0, 0)
            .map(|ndt| ndt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }
}

/// Format a date the way the high/low log stores it: `M-D-YYYY`.
#[must_use]
pub fn format_log_date(date: NaiveDate) -> String {
    date.format("%-m-%-d-%Y").to_string()
}

/// Parse a `M-D-YYYY` date from the high/low log.
pub fn parse_log_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.trim().splitn(3, '-');
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    let year = parts.next()?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
