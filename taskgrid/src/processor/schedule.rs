//! Activity windows of a dispatcher endpoint.
//!
//! ```text
//! workingDay=0:00-8:45,19:00-23:59; weekend=0:00-23:59; fri=0:00-6:00
//! ```
//!
//! `workingDay` sets Monday to Friday, `weekend` sets Saturday and Sunday,
//! and a day key (`mon`..`sun`) overrides either. Days without an entry are
//! always active. Both ends of a period are inclusive.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::errors::ConfigError;

const PERIOD_PATTERN: &str = r"^(\d{1,2}):(\d{1,2})\s*-\s*(\d{1,2}):(\d{1,2})$";

#[allow(clippy::expect_used)]
static PERIOD: LazyLock<Regex> = LazyLock::new(|| Regex::new(PERIOD_PATTERN).expect("period pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Period {
    start: NaiveTime,
    end: NaiveTime,
}

impl Period {
    fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

/// A parsed schedule window. The default schedule is always active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    source: String,
    /// Periods per weekday, Monday first; `None` means always active.
    days: [Option<Vec<Period>>; 7],
}

impl Schedule {
    /// Parses a schedule. Blank input yields the always-active schedule.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut schedule = Self {
            source: input.trim().to_string(),
            ..Self::default()
        };
        if schedule.source.is_empty() {
            return Ok(schedule);
        }

        let invalid = |reason: String| ConfigError::InvalidSchedule {
            input: input.to_string(),
            reason,
        };

        let mut overrides = Vec::new();
        for entry in input.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, periods) = entry
                .split_once('=')
                .ok_or_else(|| invalid(format!("entry '{entry}' has no '='")))?;
            let periods = parse_periods(periods).map_err(&invalid)?;
            match key.trim() {
                "workingDay" => {
                    for day in 0..5 {
                        schedule.days[day] = Some(periods.clone());
                    }
                }
                "weekend" => {
                    schedule.days[5] = Some(periods.clone());
                    schedule.days[6] = Some(periods);
                }
                other => {
                    let day = day_index(other).ok_or_else(|| invalid(format!("unknown key '{other}'")))?;
                    overrides.push((day, periods));
                }
            }
        }
        for (day, periods) in overrides {
            schedule.days[day] = Some(periods);
        }
        Ok(schedule)
    }

    /// Returns true if the endpoint may be polled at `at` (local time).
    #[must_use]
    pub fn is_active(&self, at: NaiveDateTime) -> bool {
        let day = at.weekday().num_days_from_monday() as usize;
        let time = NaiveTime::from_hms_opt(at.hour(), at.minute(), 0).unwrap_or(NaiveTime::MIN);
        match &self.days[day] {
            None => true,
            Some(periods) => periods.iter().any(|p| p.contains(time)),
        }
    }

    /// Checks the schedule against the local clock.
    #[must_use]
    pub fn is_active_now(&self) -> bool {
        self.is_active(chrono::Local::now().naive_local())
    }

    /// Returns true if every day is always active.
    #[must_use]
    pub fn is_always_active(&self) -> bool {
        self.days.iter().all(Option::is_none)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn day_index(key: &str) -> Option<usize> {
    let day = match key {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(day.num_days_from_monday() as usize)
}

fn parse_periods(text: &str) -> Result<Vec<Period>, String> {
    let mut periods = Vec::new();
    for raw in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let caps = PERIOD
            .captures(raw)
            .ok_or_else(|| format!("period '{raw}' is not HH:MM-HH:MM"))?;
        let time = |h: usize, m: usize| -> Result<NaiveTime, String> {
            let hour: u32 = caps[h].parse().map_err(|_| format!("bad hour in '{raw}'"))?;
            let minute: u32 = caps[m].parse().map_err(|_| format!("bad minute in '{raw}'"))?;
            NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| format!("time out of range in '{raw}'"))
        };
        let start = time(1, 2)?;
        let end = time(3, 4)?;
        if end < start {
            return Err(format!("period '{raw}' ends before it starts"));
        }
        periods.push(Period { start, end });
    }
    if periods.is_empty() {
        return Err("no periods given".to_string());
    }
    Ok(periods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2024-01-01 was a Monday.
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 17)
            .unwrap()
    }

    #[test]
    fn test_empty_schedule_is_always_active() {
        let schedule = Schedule::parse("  ").unwrap();
        assert!(schedule.is_always_active());
        assert!(schedule.is_active(at(3, 12, 0)));
    }

    #[test]
    fn test_working_day_periods() {
        let schedule = Schedule::parse("workingDay=0:00-8:45,19:00-23:59").unwrap();
        assert!(schedule.is_active(at(1, 0, 0)));
        assert!(schedule.is_active(at(1, 8, 45)));
        assert!(schedule.is_active(at(2, 23, 59)));
        assert!(!schedule.is_active(at(2, 12, 0)));
        // Saturday has no entry.
        assert!(schedule.is_active(at(6, 12, 0)));
    }

    #[test]
    fn test_day_overrides_group() {
        let schedule = Schedule::parse("fri=10:00-11:00; workingDay=0:00-1:00; weekend=0:00-23:59").unwrap();
        assert!(schedule.is_active(at(5, 10, 30)));
        assert!(!schedule.is_active(at(5, 0, 30)));
        assert!(schedule.is_active(at(4, 0, 30)));
        assert!(schedule.is_active(at(7, 15, 0)));
    }

    #[test]
    fn test_invalid_schedules() {
        for input in ["workingDay", "holiday=0:00-1:00", "mon=25:00-26:00", "mon=9:00-8:00", "mon=abc"] {
            assert!(
                matches!(Schedule::parse(input), Err(ConfigError::InvalidSchedule { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_period_pattern_accepts_spaced_ranges() {
        assert!(PERIOD.is_match("7:05 - 9:30"));
        assert!(!PERIOD.is_match("7:05-9"));
        let schedule = Schedule::parse("sun=7:05 - 9:30").unwrap();
        assert!(schedule.is_active(at(7, 9, 30)));
        assert!(!schedule.is_active(at(7, 9, 31)));
    }
}
