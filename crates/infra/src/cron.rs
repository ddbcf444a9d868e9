//! Cron expression parser.
//!
//! Supports `MIN HOUR DOM MON DOW` (5 fields) and a 6-field form with a leading seconds
//! field, which is accepted and ignored since schedules resolve to whole minutes.
//!
//! Per field: `*`, `N`, `A-B`, lists (`1,15,30`), and steps (`*/N`, `A-B/N`, `A/N`).
//! Day of week is 0-7 with both 0 and 7 meaning Sunday. When both day of month and day
//! of week are restricted, a day matches if either matches.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// Longest gap searched for the next fire instant (covers `0 0 29 2 *`).
const MAX_SEARCH_DAYS: u32 = 8 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} step must be positive")]
    ZeroStep { field: &'static str },
}

/// A cron field as a bitset of accepted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    /// False when the field was written as `*` (or `*/N`).
    restricted: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    fn parse(text: &str, name: &'static str, min: u32, max: u32) -> Result<Self, CronParseError> {
        let invalid = || CronParseError::InvalidField {
            field: name,
            value: text.to_string(),
        };
        let number = |s: &str| -> Result<u32, CronParseError> {
            let value: u32 = s.parse().map_err(|_| invalid())?;
            if value < min || value > max {
                return Err(CronParseError::OutOfRange {
                    field: name,
                    value,
                    min,
                    max,
                });
            }
            Ok(value)
        };

        let mut bits = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(CronParseError::ZeroStep { field: name });
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (number(a)?, number(b)?);
                if a > b {
                    return Err(invalid());
                }
                (a, b)
            } else {
                let n = number(range)?;
                // `N/step` runs from N to the end of the range.
                (n, if step.is_some() { max } else { n })
            };

            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                bits |= 1 << value;
            }
        }

        Ok(Self {
            bits,
            restricted: !text.starts_with('*'),
        })
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let fields = match fields.len() {
            5 => &fields[..],
            6 => &fields[1..],
            n => return Err(CronParseError::FieldCount(n)),
        };

        let mut days_of_week = CronField::parse(fields[4], "day of week", 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.trim().to_string(),
            minutes: CronField::parse(fields[0], "minute", 0, 59)?,
            hours: CronField::parse(fields[1], "hour", 0, 23)?,
            days_of_month: CronField::parse(fields[2], "day of month", 1, 31)?,
            months: CronField::parse(fields[3], "month", 1, 12)?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether `at` (at minute resolution) is a fire instant.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.date_matches(at.date_naive())
            && self.hours.contains(at.hour())
            && self.minutes.contains(at.minute())
    }

    /// First fire instant at or after `reference` floored to the minute.
    ///
    /// `None` when nothing matches within the search horizon (e.g. `0 0 31 2 *`).
    pub fn next_from(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = floor_to_minute(reference);
        let mut date = start.date_naive();

        for day in 0..MAX_SEARCH_DAYS {
            if self.date_matches(date) {
                let first_day = day == 0;
                let from_hour = if first_day { start.hour() } else { 0 };
                for hour in (from_hour..24).filter(|h| self.hours.contains(*h)) {
                    let from_minute = if first_day && hour == start.hour() {
                        start.minute()
                    } else {
                        0
                    };
                    if let Some(minute) = (from_minute..60).find(|m| self.minutes.contains(*m)) {
                        return date.and_hms_opt(hour, minute, 0).map(|dt| dt.and_utc());
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

pub fn floor_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, reference: DateTime<Utc>) -> DateTime<Utc> {
        CronExpr::parse(expr).unwrap().next_from(reference).unwrap()
    }

    #[test]
    fn matching_minute_is_its_own_fire_instant() {
        let reference = at(2026, 2, 22, 10, 30, 42);
        assert_eq!(next("* * * * *", reference), at(2026, 2, 22, 10, 30, 0));
        assert_eq!(next("30 10 * * *", reference), at(2026, 2, 22, 10, 30, 0));
    }

    #[test]
    fn every_hour() {
        assert_eq!(
            next("0 * * * *", at(2026, 2, 22, 10, 30, 0)),
            at(2026, 2, 22, 11, 0, 0)
        );
    }

    #[test]
    fn daily_rolls_to_next_day() {
        assert_eq!(
            next("0 8 * * *", at(2026, 2, 22, 9, 0, 0)),
            at(2026, 2, 23, 8, 0, 0)
        );
    }

    #[test]
    fn steps_and_ranges() {
        assert_eq!(
            next("*/15 * * * *", at(2026, 2, 22, 10, 2, 0)),
            at(2026, 2, 22, 10, 15, 0)
        );
        assert_eq!(
            next("10-40/10 * * * *", at(2026, 2, 22, 10, 41, 0)),
            at(2026, 2, 22, 11, 10, 0)
        );
        assert_eq!(
            next("5,50 9-17 * * *", at(2026, 2, 22, 17, 51, 0)),
            at(2026, 2, 23, 9, 5, 0)
        );
    }

    #[test]
    fn seconds_field_is_ignored() {
        assert_eq!(
            next("30 0 12 * * *", at(2026, 2, 22, 11, 0, 0)),
            at(2026, 2, 22, 12, 0, 0)
        );
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        // 2026-02-22 is a Sunday.
        let monday = at(2026, 2, 23, 0, 0, 0);
        assert_eq!(next("0 0 * * 7", monday), at(2026, 3, 1, 0, 0, 0));
        assert_eq!(next("0 0 * * 0", monday), at(2026, 3, 1, 0, 0, 0));
    }

    #[test]
    fn restricted_dom_and_dow_are_alternatives() {
        // 1st of the month OR a Monday.
        let expr = CronExpr::parse("0 0 1 * 1").unwrap();
        assert_eq!(expr.next_from(at(2026, 2, 24, 0, 0, 0)), Some(at(2026, 3, 1, 0, 0, 0)));
        assert_eq!(expr.next_from(at(2026, 2, 22, 1, 0, 0)), Some(at(2026, 2, 23, 0, 0, 0)));
    }

    #[test]
    fn leap_day_is_found() {
        assert_eq!(
            next("0 0 29 2 *", at(2026, 3, 1, 0, 0, 0)),
            at(2028, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn impossible_date_has_no_fire_instant() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_from(at(2026, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(CronExpr::parse("bad"), Err(CronParseError::FieldCount(1)));
        assert!(matches!(
            CronExpr::parse("60 * * * *"),
            Err(CronParseError::OutOfRange { value: 60, .. })
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *"),
            Err(CronParseError::ZeroStep { .. })
        ));
        assert!(matches!(
            CronExpr::parse("a * * * *"),
            Err(CronParseError::InvalidField { .. })
        ));
        assert!(CronExpr::parse("0 0 0 * *").is_err());
    }

    #[test]
    fn matches_checks_every_field() {
        let expr: CronExpr = "15 10 * 2 *".parse().unwrap();
        assert!(expr.matches(at(2026, 2, 3, 10, 15, 59)));
        assert!(!expr.matches(at(2026, 3, 3, 10, 15, 0)));
        assert_eq!(expr.to_string(), "15 10 * 2 *");
    }
}
