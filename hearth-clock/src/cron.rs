//! Five-field cron expression parsing and evaluation
//!
//! Expressions use the classic `minute hour day-of-month month
//! day-of-week` form. Evaluation runs on framework timestamps via
//! chrono's calendar decomposition, so cron schedules obey the
//! simulation clock in tests.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use hearth_types::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a cron expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    /// Wrong number of whitespace-separated fields.
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),
    /// A field contained an unparseable token.
    #[error("invalid cron field {field:?}: {token:?}")]
    InvalidField { field: &'static str, token: String },
    /// A value fell outside the field's range.
    #[error("cron value {value} out of range {min}..={max} for {field}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// One cron field as an explicit membership set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FieldSet {
    /// Sorted, deduplicated allowed values.
    values: Vec<u32>,
    /// Whether the field was written as `*` (matters for the
    /// day-of-month/day-of-week union rule).
    any: bool,
}

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.values.binary_search(&v).is_ok()
    }
}

fn parse_field(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<FieldSet, CronParseError> {
    let any = text == "*";
    let mut values = Vec::new();
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| CronParseError::InvalidField {
                    field,
                    token: part.to_string(),
                })?;
                if step == 0 {
                    return Err(CronParseError::InvalidField {
                        field,
                        token: part.to_string(),
                    });
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| CronParseError::InvalidField {
                field,
                token: part.to_string(),
            })?;
            let hi: u32 = b.parse().map_err(|_| CronParseError::InvalidField {
                field,
                token: part.to_string(),
            })?;
            (lo, hi)
        } else {
            let v: u32 = range.parse().map_err(|_| CronParseError::InvalidField {
                field,
                token: part.to_string(),
            })?;
            (v, v)
        };
        for v in [lo, hi] {
            if v < min || v > max {
                return Err(CronParseError::OutOfRange {
                    field,
                    value: v,
                    min,
                    max,
                });
            }
        }
        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(FieldSet { values, any })
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    /// Parse an expression like `"0 6 * * 1-5"`.
    ///
    /// Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday. When
    /// both day fields are restricted, a day matches if *either* does
    /// (the traditional union rule).
    pub fn parse(text: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        let mut day_of_week = parse_field(fields[4], "day-of-week", 0, 7)?;
        // Normalize 7 -> 0 (Sunday).
        if day_of_week.values.last() == Some(&7) {
            day_of_week.values.pop();
            if !day_of_week.contains(0) {
                day_of_week.values.insert(0, 0);
            }
        }
        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week,
        })
    }

    fn day_matches(&self, dt: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(dt.day());
        let dow = self
            .day_of_week
            .contains(dt.weekday().num_days_from_sunday());
        match (self.day_of_month.any, self.day_of_week.any) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// Whether the minute containing `ts` matches.
    pub fn matches(&self, ts: Timestamp) -> bool {
        let Some(dt) = Utc.timestamp_millis_opt(ts.0).single() else {
            return false;
        };
        self.minute.contains(dt.minute())
            && self.hour.contains(dt.hour())
            && self.month.contains(dt.month())
            && self.day_matches(&dt)
    }

    /// The first matching minute boundary strictly after `ts`.
    ///
    /// Scans forward field-by-field (month, then day, then hour, then
    /// minute), bounded at four years so an unsatisfiable expression
    /// (e.g. Feb 30) returns `None` instead of spinning.
    pub fn next_after(&self, ts: Timestamp) -> Option<Timestamp> {
        let start = Utc.timestamp_millis_opt(ts.0).single()?;
        let mut dt = start
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let limit = start.checked_add_signed(Duration::days(4 * 366))?;
        while dt <= limit {
            if !self.month.contains(dt.month()) {
                // Jump to the first instant of the next month.
                let (y, m) = if dt.month() == 12 {
                    (dt.year() + 1, 1)
                } else {
                    (dt.year(), dt.month() + 1)
                };
                dt = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&dt) {
                dt = (dt + Duration::days(1))
                    .with_hour(0)?
                    .with_minute(0)?;
                continue;
            }
            if !self.hour.contains(dt.hour()) {
                dt = (dt + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minute.contains(dt.minute()) {
                dt = dt + Duration::minutes(1);
                continue;
            }
            return Some(Timestamp(dt.timestamp_millis()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> Timestamp {
        let dt = DateTime::parse_from_rfc3339(text).unwrap();
        Timestamp(dt.timestamp_millis())
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(
            CronExpr::parse("* * *"),
            Err(CronParseError::FieldCount(3))
        ));
        assert!(matches!(
            CronExpr::parse("61 * * * *"),
            Err(CronParseError::OutOfRange { .. })
        ));
        assert!(matches!(
            CronExpr::parse("x * * * *"),
            Err(CronParseError::InvalidField { .. })
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *"),
            Err(CronParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_every_minute() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let now = ts("2024-03-01T10:15:30Z");
        assert_eq!(expr.next_after(now), Some(ts("2024-03-01T10:16:00Z")));
    }

    #[test]
    fn test_daily_at_six() {
        let expr = CronExpr::parse("0 6 * * *").unwrap();
        let now = ts("2024-03-01T10:15:00Z");
        assert_eq!(expr.next_after(now), Some(ts("2024-03-02T06:00:00Z")));
        assert!(expr.matches(ts("2024-03-02T06:00:10Z")));
        assert!(!expr.matches(ts("2024-03-02T07:00:00Z")));
    }

    #[test]
    fn test_weekday_union_rule() {
        // dom restricted AND dow restricted: either may match.
        let expr = CronExpr::parse("0 0 15 * 1").unwrap();
        // 2024-04-15 is a Monday; both match on the same day here.
        assert_eq!(
            expr.next_after(ts("2024-04-13T00:00:00Z")),
            Some(ts("2024-04-15T00:00:00Z"))
        );
        // After that, the next Monday (dow) comes before the next 15th.
        assert_eq!(
            expr.next_after(ts("2024-04-15T00:00:00Z")),
            Some(ts("2024-04-22T00:00:00Z"))
        );
    }

    #[test]
    fn test_step_and_range() {
        let expr = CronExpr::parse("*/15 8-10 * * *").unwrap();
        assert_eq!(
            expr.next_after(ts("2024-01-01T08:16:00Z")),
            Some(ts("2024-01-01T08:30:00Z"))
        );
        assert_eq!(
            expr.next_after(ts("2024-01-01T10:46:00Z")),
            Some(ts("2024-01-02T08:00:00Z"))
        );
    }

    #[test]
    fn test_unsatisfiable_returns_none() {
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(expr.next_after(ts("2024-01-01T00:00:00Z")), None);
    }

    #[test]
    fn test_sunday_as_seven() {
        let expr = CronExpr::parse("0 12 * * 7").unwrap();
        // 2024-03-03 is a Sunday.
        assert_eq!(
            expr.next_after(ts("2024-03-01T00:00:00Z")),
            Some(ts("2024-03-03T12:00:00Z"))
        );
    }
}
