//! When a deferred action fires

use crate::core::error::ScheduleError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fire time of a scheduled action, absolute or relative to a start time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSchedule {
    /// Absolute instant
    At(DateTime<Utc>),
    /// Delay after the start time
    After(Duration),
    /// Date string in a chrono format; UTC unless the format carries an offset
    Date {
        /// The date
        date: String,
        /// chrono format string, e.g. `%Y-%m-%d %H:%M:%S`
        format: String,
    },
}

impl JobSchedule {
    /// Relative schedule
    pub fn after(delay: Duration) -> Self {
        Self::After(delay)
    }

    /// Schedule from a date string and its format
    pub fn date(date: impl Into<String>, format: impl Into<String>) -> Self {
        Self::Date {
            date: date.into(),
            format: format.into(),
        }
    }

    /// Absolute fire time in epoch milliseconds for a job started at `start_time_millis`
    pub fn fire_time_millis(&self, start_time_millis: u64) -> Result<u64, ScheduleError> {
        match self {
            Self::At(instant) => Ok(instant.timestamp_millis().max(0) as u64),
            Self::After(delay) => {
                Ok(start_time_millis.saturating_add(delay.as_millis().min(u64::MAX as u128) as u64))
            }
            Self::Date { date, format } => {
                let instant = parse_date(date, format)?;
                Ok(instant.timestamp_millis().max(0) as u64)
            }
        }
    }
}

fn parse_date(date: &str, format: &str) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(instant) = DateTime::parse_from_str(date, format) {
        return Ok(instant.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(date, format) {
        Ok(naive) => Ok(naive.and_utc()),
        Err(source) => NaiveDate::parse_from_str(date, format)
            .ok()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .ok_or_else(|| ScheduleError::InvalidDate {
                date: date.to_string(),
                format: format.to_string(),
                source,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_relative_schedule() {
        let schedule = JobSchedule::after(Duration::from_millis(1500));
        assert_eq!(schedule.fire_time_millis(10_000).unwrap(), 11_500);
    }

    #[test]
    fn test_absolute_schedule() {
        let instant = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let schedule = JobSchedule::At(instant);
        assert_eq!(schedule.fire_time_millis(0).unwrap(), instant.timestamp_millis() as u64);
    }

    #[test]
    fn test_date_formats() {
        let expected = Utc.with_ymd_and_hms(2030, 6, 1, 12, 30, 0).unwrap().timestamp_millis() as u64;
        let schedule = JobSchedule::date("2030-06-01 12:30:00", "%Y-%m-%d %H:%M:%S");
        assert_eq!(schedule.fire_time_millis(0).unwrap(), expected);

        let schedule = JobSchedule::date("2030-06-01 14:30:00 +0200", "%Y-%m-%d %H:%M:%S %z");
        assert_eq!(schedule.fire_time_millis(0).unwrap(), expected);

        let midnight = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap().timestamp_millis() as u64;
        let schedule = JobSchedule::date("01/06/2030", "%d/%m/%Y");
        assert_eq!(schedule.fire_time_millis(0).unwrap(), midnight);
    }

    #[test]
    fn test_unparseable_date() {
        let schedule = JobSchedule::date("tomorrow", "%Y-%m-%d");
        let err = schedule.fire_time_millis(0).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidDate { ref date, .. } if date == "tomorrow"));
    }
}
