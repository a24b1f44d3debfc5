//! Next-run calculation for site backup schedules.
//!
//! All arithmetic happens in the tenant's local civil time so a 02:30 daily backup
//! stays at 02:30 on the wall clock across DST changes. The result is a UTC instant.
//! Nothing here performs I/O.

use chrono::{
    DateTime, Datelike, Days, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Upper bound for the weekly forward scan.
const WEEKLY_SCAN_DAYS: u64 = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown schedule frequency '{0}'")]
    UnknownFrequency(String),
    #[error("invalid schedule time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for Frequency {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "manual" => Ok(Self::Manual),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(ScheduleError::UnknownFrequency(other.to_string())),
        }
    }
}

/// Parsed schedule of one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Manual,
    Daily {
        time: NaiveTime,
    },
    Weekly {
        time: NaiveTime,
        /// Weekday indices, 0 = Monday
        days: Vec<u32>,
        fallback: bool,
    },
    Monthly {
        time: NaiveTime,
        /// Day of month in 1..=31
        day: u32,
        fallback: bool,
    },
}

impl Schedule {
    /// Parse the raw site fields.
    ///
    /// Malformed `days` never fail: weekly falls back to every day and monthly to the
    /// 1st, with `is_fallback()` reporting it. A bad time or frequency is an error.
    pub fn parse(frequency: &str, time: &str, days: Option<&str>) -> Result<Self, ScheduleError> {
        let frequency: Frequency = frequency.parse()?;
        if frequency == Frequency::Manual {
            return Ok(Self::Manual);
        }

        let time = parse_time(time)?;

        Ok(match frequency {
            Frequency::Manual => Self::Manual,
            Frequency::Daily => Self::Daily { time },
            Frequency::Weekly => {
                let mut parsed: Vec<u32> = days
                    .unwrap_or("")
                    .split(',')
                    .filter_map(|d| d.trim().parse::<u32>().ok())
                    .filter(|d| *d <= 6)
                    .collect();
                parsed.sort_unstable();
                parsed.dedup();

                if parsed.is_empty() {
                    Self::Weekly {
                        time,
                        days: (0..=6).collect(),
                        fallback: true,
                    }
                } else {
                    Self::Weekly {
                        time,
                        days: parsed,
                        fallback: false,
                    }
                }
            }
            Frequency::Monthly => match days.and_then(|d| d.trim().parse::<i64>().ok()) {
                Some(day) => Self::Monthly {
                    time,
                    day: day.clamp(1, 31) as u32,
                    fallback: false,
                },
                None => Self::Monthly {
                    time,
                    day: 1,
                    fallback: true,
                },
            },
        })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    /// True when the configured days were unusable and a default was substituted.
    pub fn is_fallback(&self) -> bool {
        match self {
            Self::Weekly { fallback, .. } | Self::Monthly { fallback, .. } => *fallback,
            _ => false,
        }
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

/// Compute the next run strictly after `now`, or `None` for manual schedules.
pub fn calculate_next_run(schedule: &Schedule, now: DateTime<Tz>) -> Option<DateTime<Utc>> {
    let tz = now.timezone();
    let today = now.date_naive();

    let next = match schedule {
        Schedule::Manual => return None,
        Schedule::Daily { time } => (0..=2)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .map(|date| resolve_local(&tz, date.and_time(*time)))
            .find(|candidate| *candidate > now),
        Schedule::Weekly { time, days, .. } => (0..=WEEKLY_SCAN_DAYS)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .filter(|date| days.contains(&date.weekday().num_days_from_monday()))
            .map(|date| resolve_local(&tz, date.and_time(*time)))
            .find(|candidate| *candidate > now),
        Schedule::Monthly { time, day, .. } => next_monthly(&tz, now, *day, *time),
    };

    next.map(|dt| dt.with_timezone(&Utc))
}

fn next_monthly(tz: &Tz, now: DateTime<Tz>, day: u32, time: NaiveTime) -> Option<DateTime<Tz>> {
    let first_of_month = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)?;

    if let Some(date) = NaiveDate::from_ymd_opt(now.year(), now.month(), day) {
        let candidate = resolve_local(tz, date.and_time(time));
        if candidate > now {
            return Some(candidate);
        }
    }

    // Roll forward, reusing the same day where the month is long enough.
    let next_month = first_of_month.checked_add_months(Months::new(1))?;
    let day = day.min(days_in_month(next_month.year(), next_month.month()));
    let date = NaiveDate::from_ymd_opt(next_month.year(), next_month.month(), day)?;
    Some(resolve_local(tz, date.and_time(time)))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Map a local wall-clock time to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant; times inside a
/// gap (clocks going forward) shift forward by an hour.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = local + chrono::Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
                LocalResult::None => tz.from_utc_datetime(&local),
            }
        }
    }
}
