//! Cadence expressions: five-field cron-style triggers for backup schedules.
//!
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31, or L for the last day)
//! │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ ┌───────────── day of week (0-7, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! Each field is `*`, a value, a range `a-b`, a step `*/n` or `a-b/n`, or a
//! comma-separated list of those. Evaluation is a pure function of the
//! timestamp, so the scheduler and the schedule listing share it.

use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead [`CadenceExpr::next_after`] looks before giving up.
const NEXT_SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    #[error("Expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("Invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid {field} range {start}-{end}")]
    InvalidRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
    #[error("Invalid {field} step '{step}'")]
    InvalidStep { field: &'static str, step: String },
    #[error("'L' is only allowed in the day-of-month field, found in {0}")]
    LastDayNotAllowed(&'static str),
}

/// Matcher for a single cadence field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatcher {
    /// `*`: every value.
    Any,
    /// Explicit values, expanded from literals, ranges and steps.
    Values(BTreeSet<u32>),
    /// Day-of-month only: the last day of the month, plus any explicit days.
    LastDay { also: BTreeSet<u32> },
}

impl FieldMatcher {
    fn matches(&self, value: u32, last_day: u32) -> bool {
        match self {
            FieldMatcher::Any => true,
            FieldMatcher::Values(values) => values.contains(&value),
            FieldMatcher::LastDay { also } => value == last_day || also.contains(&value),
        }
    }

    fn is_restricted(&self) -> bool {
        !matches!(self, FieldMatcher::Any)
    }

    /// Candidate values in ascending order within `min..=max`.
    fn candidates(&self, min: u32, max: u32) -> Vec<u32> {
        match self {
            FieldMatcher::Any => (min..=max).collect(),
            FieldMatcher::Values(values) => values.range(min..=max).copied().collect(),
            FieldMatcher::LastDay { .. } => (min..=max).collect(),
        }
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    allows_last_day: bool,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    allows_last_day: false,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    allows_last_day: false,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    allows_last_day: true,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    allows_last_day: false,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    allows_last_day: false,
};

impl FieldSpec {
    fn parse(&self, expr: &str) -> Result<FieldMatcher, CadenceError> {
        if expr == "*" {
            return Ok(FieldMatcher::Any);
        }

        let mut values = BTreeSet::new();
        let mut last_day = false;
        for part in expr.split(',') {
            if part.eq_ignore_ascii_case("L") {
                if !self.allows_last_day {
                    return Err(CadenceError::LastDayNotAllowed(self.name));
                }
                last_day = true;
                continue;
            }
            self.parse_part(part, &mut values)?;
        }

        // Sunday is both 0 and 7.
        if self.name == DAY_OF_WEEK.name && values.remove(&7) {
            values.insert(0);
        }

        if last_day {
            Ok(FieldMatcher::LastDay { also: values })
        } else {
            Ok(FieldMatcher::Values(values))
        }
    }

    fn parse_part(&self, part: &str, values: &mut BTreeSet<u32>) -> Result<(), CadenceError> {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| CadenceError::InvalidStep {
                        field: self.name,
                        step: step.to_string(),
                    })?;
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (self.min, self.max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = self.parse_value(start)?;
            let end = self.parse_value(end)?;
            if start > end {
                return Err(CadenceError::InvalidRange {
                    field: self.name,
                    start,
                    end,
                });
            }
            (start, end)
        } else {
            let value = self.parse_value(range)?;
            // `5/15` means "from 5 to the end of the field, every 15".
            if step > 1 {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        values.extend((start..=end).step_by(step as usize));
        Ok(())
    }

    fn parse_value(&self, s: &str) -> Result<u32, CadenceError> {
        let value = s.parse::<u32>().map_err(|_| CadenceError::InvalidValue {
            field: self.name,
            value: s.to_string(),
        })?;
        if value < self.min || value > self.max {
            return Err(CadenceError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }
}

/// A parsed cadence expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceExpr {
    source: String,
    minute: FieldMatcher,
    hour: FieldMatcher,
    day_of_month: FieldMatcher,
    month: FieldMatcher,
    day_of_week: FieldMatcher,
}

impl CadenceExpr {
    pub fn parse(expr: &str) -> Result<Self, CadenceError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CadenceError::FieldCount(fields.len()));
        }

        Ok(Self {
            source: fields.join(" "),
            minute: MINUTE.parse(fields[0])?,
            hour: HOUR.parse(fields[1])?,
            day_of_month: DAY_OF_MONTH.parse(fields[2])?,
            month: MONTH.parse(fields[3])?,
            day_of_week: DAY_OF_WEEK.parse(fields[4])?,
        })
    }

    /// Normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the expression fires at `at`, truncated to the minute.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.matches_local(&at.naive_local())
    }

    /// Same as [`matches`](Self::matches) on a wall-clock time with no zone.
    pub fn matches_local(&self, at: &NaiveDateTime) -> bool {
        self.minute.matches(at.minute(), 0)
            && self.hour.matches(at.hour(), 0)
            && self.date_matches(at.date())
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month(), 0) {
            return false;
        }

        let last_day = last_day_of_month(date.year(), date.month());
        let dom = self.day_of_month.matches(date.day(), last_day);
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday(), 0);

        // When both day fields are restricted either one is enough.
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First firing time strictly after `after`, in the same zone.
    ///
    /// Wall-clock times that do not exist in the zone (DST gaps) are skipped.
    /// Returns `None` if nothing fires within the search horizon.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let start = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        let hours = self.hour.candidates(0, 23);
        let minutes = self.minute.candidates(0, 59);

        for offset in 0..NEXT_SEARCH_DAYS {
            let date = start.date() + Duration::days(offset);
            if !self.date_matches(date) {
                continue;
            }
            for &hour in &hours {
                for &minute in &minutes {
                    let Some(candidate) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    if candidate < start {
                        continue;
                    }
                    if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
                        if resolved > *after {
                            return Some(resolved);
                        }
                    }
                }
            }
        }
        None
    }
}

impl FromStr for CadenceExpr {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CadenceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Wall clock that cadence expressions are evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScheduleTimezone {
    /// The host's local time zone.
    #[default]
    Local,
    Utc,
}

impl ScheduleTimezone {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleTimezone::Local => "local",
            ScheduleTimezone::Utc => "utc",
        }
    }

    pub fn is_due(&self, expr: &CadenceExpr, at: DateTime<Utc>) -> bool {
        match self {
            ScheduleTimezone::Local => expr.matches(&at.with_timezone(&Local)),
            ScheduleTimezone::Utc => expr.matches(&at),
        }
    }

    pub fn next_due(&self, expr: &CadenceExpr, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleTimezone::Local => expr
                .next_after(&after.with_timezone(&Local))
                .map(|next| next.with_timezone(&Utc)),
            ScheduleTimezone::Utc => expr.next_after(&after),
        }
    }
}

impl FromStr for ScheduleTimezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ScheduleTimezone::Local),
            "utc" => Ok(ScheduleTimezone::Utc),
            other => Err(format!(
                "Unknown schedule timezone '{}' (expected 'local' or 'utc')",
                other
            )),
        }
    }
}

pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_all_wildcards_always_due() {
        let expr = CadenceExpr::parse("* * * * *").unwrap();
        let mut t = at("2024-02-28T23:00:00Z");
        for _ in 0..180 {
            assert!(expr.matches(&t), "{} should be due", t);
            t += Duration::minutes(1);
        }
        assert!(expr.matches(&at("2023-12-31T23:59:00Z")));
    }

    #[test]
    fn test_daily_at_two() {
        let expr = CadenceExpr::parse("0 2 * * *").unwrap();
        assert!(expr.matches(&at("2024-01-15T02:00:00Z")));
        assert!(expr.matches(&at("2024-01-15T02:00:59Z")));
        assert!(!expr.matches(&at("2024-01-15T02:01:00Z")));
        assert!(!expr.matches(&at("2024-01-15T03:00:00Z")));

        let next = expr.next_after(&at("2024-01-15T02:00:00Z")).unwrap();
        assert_eq!(next, at("2024-01-16T02:00:00Z"));
    }

    #[test]
    fn test_last_day_of_month() {
        let expr = CadenceExpr::parse("30 23 L * *").unwrap();
        assert!(expr.matches(&at("2023-02-28T23:30:00Z")));
        assert!(!expr.matches(&at("2024-02-28T23:30:00Z")));
        assert!(expr.matches(&at("2024-02-29T23:30:00Z")));
        assert!(expr.matches(&at("2024-04-30T23:30:00Z")));
        assert!(!expr.matches(&at("2024-05-30T23:30:00Z")));
        assert!(expr.matches(&at("2024-05-31T23:30:00Z")));
        assert!(expr.matches(&at("2024-12-31T23:30:00Z")));

        let next = expr.next_after(&at("2023-02-01T00:00:00Z")).unwrap();
        assert_eq!(next, at("2023-02-28T23:30:00Z"));
    }

    #[test]
    fn test_last_day_combined_with_values() {
        let expr = CadenceExpr::parse("0 0 1,15,L * *").unwrap();
        assert!(expr.matches(&at("2024-06-01T00:00:00Z")));
        assert!(expr.matches(&at("2024-06-15T00:00:00Z")));
        assert!(expr.matches(&at("2024-06-30T00:00:00Z")));
        assert!(!expr.matches(&at("2024-06-29T00:00:00Z")));
    }

    #[test]
    fn test_ranges_steps_and_lists() {
        let expr = CadenceExpr::parse("*/15 9-17 * * 1-5").unwrap();
        // 2024-01-15 is a Monday.
        assert!(expr.matches(&at("2024-01-15T09:00:00Z")));
        assert!(expr.matches(&at("2024-01-15T17:45:00Z")));
        assert!(!expr.matches(&at("2024-01-15T09:10:00Z")));
        assert!(!expr.matches(&at("2024-01-15T18:00:00Z")));
        assert!(!expr.matches(&at("2024-01-14T10:00:00Z")));

        let expr = CadenceExpr::parse("5,35 0-12/6 * * *").unwrap();
        assert!(expr.matches(&at("2024-01-15T06:35:00Z")));
        assert!(expr.matches(&at("2024-01-15T12:05:00Z")));
        assert!(!expr.matches(&at("2024-01-15T03:05:00Z")));
    }

    #[test]
    fn test_sunday_is_zero_and_seven() {
        let zero = CadenceExpr::parse("0 3 * * 0").unwrap();
        let seven = CadenceExpr::parse("0 3 * * 7").unwrap();
        // 2024-01-14 is a Sunday.
        let sunday = at("2024-01-14T03:00:00Z");
        assert!(zero.matches(&sunday));
        assert!(seven.matches(&sunday));
        assert!(!seven.matches(&at("2024-01-13T03:00:00Z")));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // The 1st of the month or any Monday.
        let expr = CadenceExpr::parse("0 0 1 * 1").unwrap();
        assert!(expr.matches(&at("2024-02-01T00:00:00Z"))); // Thursday
        assert!(expr.matches(&at("2024-02-05T00:00:00Z"))); // Monday
        assert!(!expr.matches(&at("2024-02-06T00:00:00Z")));

        // Only day-of-month restricted: plain AND.
        let expr = CadenceExpr::parse("0 0 1 * *").unwrap();
        assert!(!expr.matches(&at("2024-02-05T00:00:00Z")));
    }

    #[test]
    fn test_matches_uses_wall_clock_of_zone() {
        let expr = CadenceExpr::parse("0 2 * * *").unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = at("2024-01-15T00:00:00Z").with_timezone(&plus_two);
        assert!(expr.matches(&local));
        assert!(!expr.matches(&at("2024-01-15T00:00:00Z")));

        let next = expr.next_after(&local).unwrap();
        assert_eq!(next.with_timezone(&Utc), at("2024-01-16T00:00:00Z"));
    }

    #[test]
    fn test_next_after_skips_to_next_month() {
        let expr = CadenceExpr::parse("0 0 31 * *").unwrap();
        let next = expr.next_after(&at("2024-04-01T00:00:00Z")).unwrap();
        assert_eq!(next, at("2024-05-31T00:00:00Z"));
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        assert_eq!(
            CadenceExpr::parse("0 2 * *"),
            Err(CadenceError::FieldCount(4))
        );
        assert!(matches!(
            CadenceExpr::parse("60 * * * *"),
            Err(CadenceError::OutOfRange { field: "minute", value: 60, .. })
        ));
        assert!(matches!(
            CadenceExpr::parse("* * 0 * *"),
            Err(CadenceError::OutOfRange { .. })
        ));
        assert!(matches!(
            CadenceExpr::parse("* 5-2 * * *"),
            Err(CadenceError::InvalidRange { .. })
        ));
        assert!(matches!(
            CadenceExpr::parse("*/0 * * * *"),
            Err(CadenceError::InvalidStep { .. })
        ));
        assert!(matches!(
            CadenceExpr::parse("* * * L *"),
            Err(CadenceError::LastDayNotAllowed("month"))
        ));
        assert!(matches!(
            CadenceExpr::parse("a * * * *"),
            Err(CadenceError::InvalidValue { .. })
        ));
        assert!(CadenceExpr::parse("").is_err());
    }

    #[test]
    fn test_normalized_source() {
        let expr: CadenceExpr = "  0   2 *  * * ".parse().unwrap();
        assert_eq!(expr.as_str(), "0 2 * * *");
        assert_eq!(expr.to_string(), "0 2 * * *");
    }

    #[test]
    fn test_schedule_timezone() {
        let expr = CadenceExpr::parse("0 2 * * *").unwrap();
        let at_two = at("2024-01-15T02:00:00Z");
        assert!(ScheduleTimezone::Utc.is_due(&expr, at_two));
        assert_eq!(
            ScheduleTimezone::Utc.next_due(&expr, at_two),
            Some(at("2024-01-16T02:00:00Z"))
        );
        assert!(ScheduleTimezone::Local.next_due(&expr, at_two).is_some());

        assert_eq!("UTC".parse::<ScheduleTimezone>(), Ok(ScheduleTimezone::Utc));
        assert_eq!("local".parse::<ScheduleTimezone>(), Ok(ScheduleTimezone::Local));
        assert!("Europe/Rome".parse::<ScheduleTimezone>().is_err());
    }

    #[test]
    fn test_last_day_of_month_helper() {
        assert_eq!(last_day_of_month(2023, 2), 28);
        assert_eq!(last_day_of_month(2024, 2), 29);
        assert_eq!(last_day_of_month(2100, 2), 28);
        assert_eq!(last_day_of_month(2024, 4), 30);
        assert_eq!(last_day_of_month(2024, 12), 31);
    }
}
