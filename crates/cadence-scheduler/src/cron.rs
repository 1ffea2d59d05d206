//! Cron expression parsing and next-fire evaluation (UTC).
//!
//! Accepts the classic five fields (`minute hour day-of-month month
//! day-of-week`) or six with a leading seconds field, plus the usual
//! `@daily`-style macros.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, SubsecRound, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// How far ahead `next_after` searches before declaring the expression
/// unsatisfiable. Covers the 8-year gap between some leap days.
const SEARCH_HORIZON_YEARS: i32 = 9;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Set of allowed values for one field, as a bitmask over `0..=59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    /// Smallest member strictly greater than `value`.
    fn next_above(&self, value: u32) -> Option<u32> {
        (value + 1..64).find(|v| self.contains(*v))
    }
}

#[derive(Clone, Copy)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::Second => "second",
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }

    fn bounds(&self) -> (u32, u32) {
        match self {
            FieldKind::Second | FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            // 7 is accepted as an alias for Sunday and folded to 0.
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn names(&self) -> Option<(&'static [&'static str], u32)> {
        match self {
            FieldKind::Month => Some((&MONTH_NAMES, 1)),
            FieldKind::DayOfWeek => Some((&WEEKDAY_NAMES, 0)),
            _ => None,
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            s if s.starts_with('@') => {
                return Err(SchedulerError::invalid_cron(expression, "unknown macro"));
            }
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(SchedulerError::invalid_cron(
                    expression,
                    format!("expected 5 or 6 fields, got {n}"),
                ));
            }
        };

        let mut days_of_week = parse_field(expression, rest[4], FieldKind::DayOfWeek)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds: parse_field(expression, sec, FieldKind::Second)?,
            minutes: parse_field(expression, rest[0], FieldKind::Minute)?,
            hours: parse_field(expression, rest[1], FieldKind::Hour)?,
            days_of_month: parse_field(expression, rest[2], FieldKind::DayOfMonth)?,
            months: parse_field(expression, rest[3], FieldKind::Month)?,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    /// The expression as written by the caller.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`.
    ///
    /// Fails only for expressions that can never fire (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let limit_year = after.year() + SEARCH_HORIZON_YEARS;
        let mut t = after.trunc_subsecs(0) + Duration::seconds(1);

        loop {
            if t.year() > limit_year {
                return Err(SchedulerError::invalid_cron(
                    &self.source,
                    "expression never fires",
                ));
            }
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t);
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t.date_naive() + Duration::days(1));
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0).and_then(|t| t.with_second(0)).unwrap_or(t)
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0).unwrap_or(t) + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t = match self.seconds.next_above(t.second()) {
                    Some(s) => t.with_second(s).unwrap_or(t),
                    None => t.with_second(0).unwrap_or(t) + Duration::minutes(1),
                };
                continue;
            }
            return Ok(t);
        }
    }

    /// Vixie-cron rule: with both day fields restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expression` and return its first fire time after `after`.
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronExpr::parse(expression)?.next_after(after)
}

/// Human-readable label for an expression, for listings.
pub fn describe(expression: &str) -> String {
    let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
    match normalized.as_str() {
        "0 9 * * *" => return "Daily at 9:00 AM".to_string(),
        "0 0 * * 0" | "@weekly" => return "Weekly on Sunday at midnight".to_string(),
        "0 0 1 * *" | "@monthly" => return "Monthly on the 1st at midnight".to_string(),
        "0 0 * * *" | "@daily" | "@midnight" => return "Daily at midnight".to_string(),
        "0 * * * *" | "@hourly" => return "Every hour".to_string(),
        "* * * * *" => return "Every minute".to_string(),
        _ => {}
    }

    // "M H * * *" with plain numbers → "Daily at H:MM AM/PM"
    let fields: Vec<&str> = normalized.split(' ').collect();
    if let [minute, hour, "*", "*", "*"] = fields.as_slice() {
        if let (Ok(m), Ok(h)) = (minute.parse::<u32>(), hour.parse::<u32>()) {
            if m < 60 && h < 24 {
                let (h12, meridiem) = match h {
                    0 => (12, "AM"),
                    1..=11 => (h, "AM"),
                    12 => (12, "PM"),
                    _ => (h - 12, "PM"),
                };
                return format!("Daily at {h12}:{m:02} {meridiem}");
            }
        }
    }
    "Custom schedule".to_string()
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn parse_field(expression: &str, field: &str, kind: FieldKind) -> Result<FieldSet> {
    let (min, max) = kind.bounds();
    let err = |reason: String| {
        SchedulerError::invalid_cron(expression, format!("{} field: {reason}", kind.name()))
    };

    if field == "?" && matches!(kind, FieldKind::DayOfMonth | FieldKind::DayOfWeek) {
        return Ok(full_range(min, max));
    }

    let mut set = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(err(format!("empty list item in {field:?}")));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("bad step {step:?}")))?;
                if step == 0 || step > max - min {
                    return Err(err(format!("step {step} outside 1-{}", max - min)));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a = parse_value(a, kind).map_err(&err)?;
            let b = parse_value(b, kind).map_err(&err)?;
            if a > b {
                return Err(err(format!("descending range {range:?}")));
            }
            (a, b)
        } else {
            let v = parse_value(range, kind).map_err(&err)?;
            // "a/n" means "from a to the end of the field, every n"
            if step.is_some() {
                (v, max)
            } else {
                (v, v)
            }
        };

        if start < min || end > max {
            return Err(err(format!("{range:?} outside {min}-{max}")));
        }

        for v in (start..=end).step_by(step.unwrap_or(1) as usize) {
            set |= 1u64 << v;
        }
    }
    Ok(FieldSet(set))
}

fn parse_value(raw: &str, kind: FieldKind) -> std::result::Result<u32, String> {
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(v);
    }
    if let Some((names, offset)) = kind.names() {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = names.iter().position(|n| *n == upper) {
            return Ok(pos as u32 + offset);
        }
    }
    Err(format!("bad value {raw:?}"))
}

fn full_range(min: u32, max: u32) -> FieldSet {
    FieldSet((min..=max).fold(0u64, |acc, v| acc | (1u64 << v)))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn start_of_next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    // Day 1 exists in every month.
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(t.date_naive());
    start_of_day(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str) -> DateTime<Utc> {
        next_fire_time(expr, at(after)).unwrap()
    }

    #[test]
    fn daily_at_nine_fires_same_day_then_next_day() {
        let first = next("0 9 * * *", "2026-03-10T08:00:00Z");
        assert_eq!(first, at("2026-03-10T09:00:00Z"));
        let second = next_fire_time("0 9 * * *", first).unwrap();
        assert_eq!(second, at("2026-03-11T09:00:00Z"));
    }

    #[test]
    fn result_is_strictly_after_input() {
        assert_eq!(
            next("*/15 * * * *", "2026-03-10T08:15:00Z"),
            at("2026-03-10T08:30:00Z")
        );
        assert_eq!(
            next("* * * * *", "2026-03-10T08:15:59.900Z"),
            at("2026-03-10T08:16:00Z")
        );
    }

    #[test]
    fn next_is_stable_and_increasing() {
        let exprs = [
            "* * * * *",
            "*/7 * * * *",
            "0 9-17 * * MON-FRI",
            "30 2 1,15 * *",
            "0 0 * * 0",
            "15 */6 * JAN,JUL *",
            "*/10 * * * * *",
        ];
        let mut t = at("2026-12-30T23:58:13.250Z");
        for expr in exprs {
            let cron = CronExpr::parse(expr).unwrap();
            for _ in 0..50 {
                let a = cron.next_after(t).unwrap();
                let b = cron.next_after(t).unwrap();
                assert_eq!(a, b, "{expr} not deterministic");
                assert!(a > t, "{expr} returned {a} <= {t}");
                t = a;
            }
        }
    }

    #[test]
    fn weekday_ranges_and_names() {
        // 2026-03-13 is a Friday
        assert_eq!(
            next("0 9-17 * * MON-FRI", "2026-03-13T17:30:00Z"),
            at("2026-03-16T09:00:00Z")
        );
        // 7 is Sunday
        assert_eq!(
            next("0 0 * * 7", "2026-03-13T12:00:00Z"),
            at("2026-03-15T00:00:00Z")
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // the 1st of the month OR any Monday
        let cron = CronExpr::parse("0 0 1 * MON").unwrap();
        // 2026-03-28 is a Saturday → Monday 30th comes before April 1st
        assert_eq!(
            cron.next_after(at("2026-03-28T00:00:00Z")).unwrap(),
            at("2026-03-30T00:00:00Z")
        );
        assert_eq!(
            cron.next_after(at("2026-03-30T00:00:00Z")).unwrap(),
            at("2026-04-01T00:00:00Z")
        );
    }

    #[test]
    fn leap_day_skips_years() {
        assert_eq!(
            next("0 0 29 2 *", "2025-01-01T00:00:00Z"),
            at("2028-02-29T00:00:00Z")
        );
    }

    #[test]
    fn year_rollover() {
        assert_eq!(
            next("@yearly", "2026-06-01T00:00:00Z"),
            at("2027-01-01T00:00:00Z")
        );
    }

    #[test]
    fn six_field_uses_seconds() {
        assert_eq!(
            next("30 * * * * *", "2026-03-10T08:00:30Z"),
            at("2026-03-10T08:01:30Z")
        );
        assert_eq!(
            next("*/20 * * * * *", "2026-03-10T08:00:41Z"),
            at("2026-03-10T08:01:00Z")
        );
    }

    #[test]
    fn step_from_start_value() {
        assert_eq!(
            next("5/20 * * * *", "2026-03-10T08:26:00Z"),
            at("2026-03-10T08:45:00Z")
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [
            "",
            "* * * *",
            "* * * * * * *",
            "61 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "5-1 * * * *",
            "*/0 * * * *",
            "*/60 * * * *",
            "5/4294967295 * * * *",
            "* */4294967296 * * *",
            "a * * * *",
            "1,,2 * * * *",
            "@fortnightly",
        ] {
            let err = CronExpr::parse(bad).unwrap_err();
            assert_eq!(err.code(), "INVALID_CRON_EXPRESSION", "{bad:?}");
        }
    }

    #[test]
    fn impossible_date_never_fires() {
        let cron = CronExpr::parse("0 0 31 2 *").unwrap();
        assert!(cron.next_after(at("2026-01-01T00:00:00Z")).is_err());
    }

    #[test]
    fn describe_known_patterns() {
        assert_eq!(describe("0 9 * * *"), "Daily at 9:00 AM");
        assert_eq!(describe("0  0 * * 0"), "Weekly on Sunday at midnight");
        assert_eq!(describe("0 0 1 * *"), "Monthly on the 1st at midnight");
        assert_eq!(describe("45 18 * * *"), "Daily at 6:45 PM");
        assert_eq!(describe("*/5 * * * 1"), "Custom schedule");
    }
}
