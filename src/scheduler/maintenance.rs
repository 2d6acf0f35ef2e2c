//! Maintenance window resolution.
//!
//! Every strategy expands into concrete `[start, end)` UTC ranges inside a
//! query window. Recurring strategies are anchored in the window's timezone,
//! so "02:00 every Sunday" stays at 02:00 local across DST changes.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

use crate::db::{MaintenanceStrategy, MaintenanceWindow, TimeRange};

/// Upper bound on generated occurrences per window and query.
const MAX_OCCURRENCES: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MaintenanceError {
    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },
    #[error("invalid rrule: {0}")]
    InvalidRrule(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl MaintenanceWindow {
    /// Resolve this window into merged ranges clipped to `[from, to)`.
    pub fn resolve_ranges(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeRange>, MaintenanceError> {
        let lo = self.active_from.map_or(from, |af| af.max(from));
        let hi = self.active_until.map_or(to, |au| au.min(to));
        if lo >= hi {
            return Ok(Vec::new());
        }

        let tz = parse_timezone(&self.timezone)?;
        let raw = match &self.strategy {
            MaintenanceStrategy::Single { starts_at, ends_at } => {
                vec![TimeRange::new(*starts_at, *ends_at)]
            }
            MaintenanceStrategy::Cron {
                expression,
                duration_minutes,
            } => cron_ranges(expression, minutes(*duration_minutes), tz, lo, hi)?,
            MaintenanceStrategy::Interval {
                every_days,
                start_date,
                start_time,
                duration_minutes,
            } => interval_ranges(
                *every_days,
                *start_date,
                *start_time,
                minutes(*duration_minutes),
                tz,
                lo,
                hi,
            )?,
            MaintenanceStrategy::Weekdays {
                days,
                start_time,
                duration_minutes,
            } => daily_ranges(*start_time, minutes(*duration_minutes), tz, lo, hi, |d| {
                days.contains(&d.weekday())
            }),
            MaintenanceStrategy::MonthDays {
                days,
                start_time,
                duration_minutes,
            } => daily_ranges(*start_time, minutes(*duration_minutes), tz, lo, hi, |d| {
                days.contains(&d.day())
            }),
            MaintenanceStrategy::Rrule {
                rule,
                dtstart,
                duration_minutes,
            } => {
                let rule = RecurrenceRule::parse(rule)?;
                rule.ranges(*dtstart, minutes(*duration_minutes), tz, lo, hi)
            }
        };

        Ok(merge_ranges(clip(raw, lo, hi)))
    }

    /// Whether `at` falls inside any range of this window.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> Result<bool, MaintenanceError> {
        Ok(self
            .resolve_ranges(at, at + Duration::seconds(1))?
            .iter()
            .any(|r| r.contains(at)))
    }
}

/// Resolve and merge ranges from several windows, skipping invalid ones.
pub fn resolve_all(windows: &[MaintenanceWindow], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<TimeRange> {
    let mut all = Vec::new();
    for window in windows {
        match window.resolve_ranges(from, to) {
            Ok(ranges) => all.extend(ranges),
            Err(e) => {
                tracing::warn!(window_id = window.id, error = %e, "Skipping invalid maintenance window");
            }
        }
    }
    merge_ranges(all)
}

/// Sort and merge overlapping or touching ranges. Empty ranges are dropped.
pub fn merge_ranges(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Total seconds of `ranges` (assumed merged) that fall inside `window`.
pub fn overlap_seconds(ranges: &[TimeRange], window: TimeRange) -> i64 {
    ranges
        .iter()
        .map(|r| TimeRange::new(r.start.max(window.start), r.end.min(window.end)).seconds())
        .sum()
}

pub fn parse_timezone(raw: &str) -> Result<Tz, MaintenanceError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Tz::UTC);
    }
    Tz::from_str(raw).map_err(|_| MaintenanceError::InvalidTimezone(raw.to_string()))
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// DST gap are shifted forward by the gap.
pub fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted).earliest() {
                Some(dt) => dt.with_timezone(&Utc),
                None => Utc.from_utc_datetime(&naive),
            }
        }
    }
}

fn minutes(m: u32) -> Duration {
    Duration::minutes(m as i64)
}

fn clip(ranges: Vec<TimeRange>, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Vec<TimeRange> {
    ranges
        .into_iter()
        .map(|r| TimeRange::new(r.start.max(lo), r.end.min(hi)))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Normalize a 5-field cron expression to the 6-field form by prepending seconds.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn cron_ranges(
    expression: &str,
    duration: Duration,
    tz: Tz,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> Result<Vec<TimeRange>, MaintenanceError> {
    let schedule = Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
        MaintenanceError::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        }
    })?;

    // A window that started before `lo` may still be running
    let scan_from = (lo - duration - Duration::seconds(1)).with_timezone(&tz);
    let mut ranges = Vec::new();
    for start in schedule.after(&scan_from).take(MAX_OCCURRENCES) {
        let start = start.with_timezone(&Utc);
        if start >= hi {
            break;
        }
        ranges.push(TimeRange::new(start, start + duration));
    }
    Ok(ranges)
}

fn interval_ranges(
    every_days: u32,
    start_date: NaiveDate,
    start_time: NaiveTime,
    duration: Duration,
    tz: Tz,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> Result<Vec<TimeRange>, MaintenanceError> {
    if every_days == 0 {
        return Err(MaintenanceError::InvalidSchedule(
            "interval must be at least one day".to_string(),
        ));
    }
    let step = every_days as i64;
    let scan_date = (lo - duration).with_timezone(&tz).date_naive() - Duration::days(1);

    let mut date = start_date;
    if scan_date > start_date {
        let skipped = (scan_date - start_date).num_days() / step;
        date = start_date + Duration::days(skipped * step);
    }

    let mut ranges = Vec::new();
    for _ in 0..MAX_OCCURRENCES {
        let start = localize(tz, date.and_time(start_time));
        if start >= hi {
            break;
        }
        ranges.push(TimeRange::new(start, start + duration));
        date += Duration::days(step);
    }
    Ok(ranges)
}

/// One occurrence per local day accepted by `matches`.
fn daily_ranges<F>(
    start_time: NaiveTime,
    duration: Duration,
    tz: Tz,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
    matches: F,
) -> Vec<TimeRange>
where
    F: Fn(NaiveDate) -> bool,
{
    let first = (lo - duration).with_timezone(&tz).date_naive() - Duration::days(1);
    let last = hi.with_timezone(&tz).date_naive() + Duration::days(1);

    let mut ranges = Vec::new();
    let mut date = first;
    let mut steps = 0;
    while date <= last && steps < MAX_OCCURRENCES {
        if matches(date) {
            let start = localize(tz, date.and_time(start_time));
            ranges.push(TimeRange::new(start, start + duration));
        }
        date += Duration::days(1);
        steps += 1;
    }
    ranges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Until {
    Local(NaiveDateTime),
    Utc(DateTime<Utc>),
}

/// The subset of RFC 5545 RRULE that legacy windows use.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecurrenceRule {
    freq: Frequency,
    interval: u32,
    by_day: Vec<Weekday>,
    by_month_day: Vec<u32>,
    count: Option<u32>,
    until: Option<Until>,
}

impl RecurrenceRule {
    fn parse(raw: &str) -> Result<Self, MaintenanceError> {
        let body = raw.trim();
        let body = body.strip_prefix("RRULE:").unwrap_or(body);

        let mut freq = None;
        let mut rule = RecurrenceRule {
            freq: Frequency::Daily,
            interval: 1,
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            count: None,
            until: None,
        };

        for part in body.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| MaintenanceError::InvalidRrule(format!("malformed part {:?}", part)))?;
            let value = value.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        other => {
                            return Err(MaintenanceError::InvalidRrule(format!(
                                "unsupported FREQ {}",
                                other
                            )))
                        }
                    })
                }
                "INTERVAL" => {
                    rule.interval = value
                        .parse()
                        .ok()
                        .filter(|n: &u32| *n > 0)
                        .ok_or_else(|| MaintenanceError::InvalidRrule(format!("bad INTERVAL {}", value)))?;
                }
                "BYDAY" => {
                    rule.by_day = value
                        .split(',')
                        .map(parse_rrule_weekday)
                        .collect::<Result<_, _>>()?;
                }
                "BYMONTHDAY" => {
                    rule.by_month_day = value
                        .split(',')
                        .map(|d| {
                            d.trim()
                                .parse::<u32>()
                                .ok()
                                .filter(|d| (1..=31).contains(d))
                                .ok_or_else(|| MaintenanceError::InvalidRrule(format!("bad BYMONTHDAY {}", d)))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "COUNT" => {
                    rule.count = Some(
                        value
                            .parse()
                            .map_err(|_| MaintenanceError::InvalidRrule(format!("bad COUNT {}", value)))?,
                    );
                }
                "UNTIL" => rule.until = Some(parse_until(value)?),
                // WKST and friends do not change the supported expansions
                _ => {}
            }
        }

        rule.freq = freq.ok_or_else(|| MaintenanceError::InvalidRrule("missing FREQ".to_string()))?;
        Ok(rule)
    }

    fn ranges(
        &self,
        dtstart: NaiveDateTime,
        duration: Duration,
        tz: Tz,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
    ) -> Vec<TimeRange> {
        let start_date = dtstart.date();
        let week_anchor = start_date - Duration::days(start_date.weekday().num_days_from_monday() as i64);

        // COUNT needs every occurrence since dtstart; otherwise skip ahead
        let scan_date = (lo - duration).with_timezone(&tz).date_naive() - Duration::days(1);
        let mut date = if self.count.is_none() && scan_date > start_date {
            scan_date
        } else {
            start_date
        };

        let mut ranges = Vec::new();
        let mut emitted = 0u32;
        for _ in 0..MAX_OCCURRENCES * 4 {
            let local = date.and_time(dtstart.time());
            let start = localize(tz, local);
            if start >= hi {
                break;
            }
            if self.until_passed(local, start) {
                break;
            }

            if local >= dtstart && self.matches(date, start_date, week_anchor) {
                if let Some(count) = self.count {
                    if emitted >= count {
                        break;
                    }
                }
                emitted += 1;
                ranges.push(TimeRange::new(start, start + duration));
            }
            date += Duration::days(1);
        }
        ranges
    }

    fn until_passed(&self, local: NaiveDateTime, start: DateTime<Utc>) -> bool {
        match &self.until {
            Some(Until::Local(until)) => local > *until,
            Some(Until::Utc(until)) => start > *until,
            None => false,
        }
    }

    fn matches(&self, date: NaiveDate, start_date: NaiveDate, week_anchor: NaiveDate) -> bool {
        let interval = self.interval as i64;
        let in_period = match self.freq {
            Frequency::Daily => (date - start_date).num_days() % interval == 0,
            Frequency::Weekly => ((date - week_anchor).num_days() / 7) % interval == 0,
            Frequency::Monthly => {
                let months = (date.year() - start_date.year()) as i64 * 12 + date.month() as i64
                    - start_date.month() as i64;
                months % interval == 0
            }
        };
        if !in_period {
            return false;
        }

        if !self.by_day.is_empty() && !self.by_day.contains(&date.weekday()) {
            return false;
        }
        if !self.by_month_day.is_empty() && !self.by_month_day.contains(&date.day()) {
            return false;
        }
        match self.freq {
            Frequency::Weekly if self.by_day.is_empty() => date.weekday() == start_date.weekday(),
            Frequency::Monthly if self.by_day.is_empty() && self.by_month_day.is_empty() => {
                date.day() == start_date.day()
            }
            _ => true,
        }
    }
}

fn parse_rrule_weekday(raw: &str) -> Result<Weekday, MaintenanceError> {
    // Ordinal prefixes ("1MO", "-1FR") are treated as every such weekday
    let code = raw.trim().trim_start_matches(|c: char| c == '+' || c == '-' || c.is_ascii_digit());
    match code.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        _ => Err(MaintenanceError::InvalidRrule(format!("bad BYDAY {}", raw))),
    }
}

fn parse_until(raw: &str) -> Result<Until, MaintenanceError> {
    let invalid = || MaintenanceError::InvalidRrule(format!("bad UNTIL {}", raw));
    if let Some(stripped) = raw.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").map_err(|_| invalid())?;
        return Ok(Until::Utc(Utc.from_utc_datetime(&naive)));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S") {
        return Ok(Until::Local(naive));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| invalid())?;
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).ok_or_else(invalid)?;
    Ok(Until::Local(date.and_time(end_of_day)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window(strategy: MaintenanceStrategy) -> MaintenanceWindow {
        MaintenanceWindow {
            id: 1,
            name: "test".to_string(),
            monitor_ids: vec![1],
            tags: vec![],
            timezone: String::new(),
            active_from: None,
            active_until: None,
            strategy,
        }
    }

    #[test]
    fn test_merge_ranges() {
        let ranges = vec![
            TimeRange::new(utc(2024, 1, 1, 3, 0), utc(2024, 1, 1, 4, 0)),
            TimeRange::new(utc(2024, 1, 1, 1, 0), utc(2024, 1, 1, 2, 0)),
            TimeRange::new(utc(2024, 1, 1, 1, 30), utc(2024, 1, 1, 3, 0)),
            TimeRange::new(utc(2024, 1, 1, 6, 0), utc(2024, 1, 1, 6, 0)),
        ];
        assert_eq!(
            merge_ranges(ranges),
            vec![TimeRange::new(utc(2024, 1, 1, 1, 0), utc(2024, 1, 1, 4, 0))]
        );
    }

    #[test]
    fn test_single_clipped_to_query() {
        let w = window(MaintenanceStrategy::Single {
            starts_at: utc(2024, 1, 1, 22, 0),
            ends_at: utc(2024, 1, 2, 2, 0),
        });
        let ranges = w.resolve_ranges(utc(2024, 1, 2, 0, 0), utc(2024, 1, 3, 0, 0)).unwrap();
        assert_eq!(ranges, vec![TimeRange::new(utc(2024, 1, 2, 0, 0), utc(2024, 1, 2, 2, 0))]);
    }

    #[test]
    fn test_active_bounds() {
        let mut w = window(MaintenanceStrategy::Weekdays {
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri, Weekday::Sat, Weekday::Sun],
            start_time: hm(1, 0),
            duration_minutes: 60,
        });
        w.active_from = Some(utc(2024, 1, 3, 0, 0));
        w.active_until = Some(utc(2024, 1, 5, 1, 30));
        let ranges = w.resolve_ranges(utc(2024, 1, 1, 0, 0), utc(2024, 1, 10, 0, 0)).unwrap();
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(utc(2024, 1, 3, 1, 0), utc(2024, 1, 3, 2, 0)),
                TimeRange::new(utc(2024, 1, 4, 1, 0), utc(2024, 1, 4, 2, 0)),
                TimeRange::new(utc(2024, 1, 5, 1, 0), utc(2024, 1, 5, 1, 30)),
            ]
        );
    }

    #[test]
    fn test_weekdays_in_timezone() {
        // 2024-03-04 is a Monday; Berlin is UTC+1 in winter
        let mut w = window(MaintenanceStrategy::Weekdays {
            days: vec![Weekday::Mon],
            start_time: hm(2, 0),
            duration_minutes: 30,
        });
        w.timezone = "Europe/Berlin".to_string();
        let ranges = w.resolve_ranges(utc(2024, 3, 1, 0, 0), utc(2024, 3, 8, 0, 0)).unwrap();
        assert_eq!(ranges, vec![TimeRange::new(utc(2024, 3, 4, 1, 0), utc(2024, 3, 4, 1, 30))]);
    }

    #[test]
    fn test_month_days() {
        let w = window(MaintenanceStrategy::MonthDays {
            days: vec![1, 31],
            start_time: hm(0, 0),
            duration_minutes: 120,
        });
        let ranges = w.resolve_ranges(utc(2024, 4, 1, 0, 0), utc(2024, 6, 1, 0, 0)).unwrap();
        // April has no 31st
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(utc(2024, 4, 1, 0, 0), utc(2024, 4, 1, 2, 0)),
                TimeRange::new(utc(2024, 5, 1, 0, 0), utc(2024, 5, 1, 2, 0)),
                TimeRange::new(utc(2024, 5, 31, 0, 0), utc(2024, 5, 31, 2, 0)),
            ]
        );
    }

    #[test]
    fn test_interval_every_three_days() {
        let w = window(MaintenanceStrategy::Interval {
            every_days: 3,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            start_time: hm(12, 0),
            duration_minutes: 60,
        });
        let ranges = w.resolve_ranges(utc(2024, 1, 5, 0, 0), utc(2024, 1, 11, 0, 0)).unwrap();
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(utc(2024, 1, 7, 12, 0), utc(2024, 1, 7, 13, 0)),
                TimeRange::new(utc(2024, 1, 10, 12, 0), utc(2024, 1, 10, 13, 0)),
            ]
        );

        let zero = window(MaintenanceStrategy::Interval {
            every_days: 0,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            start_time: hm(12, 0),
            duration_minutes: 60,
        });
        assert!(zero.resolve_ranges(utc(2024, 1, 5, 0, 0), utc(2024, 1, 11, 0, 0)).is_err());
    }

    #[test]
    fn test_cron_five_fields_and_overhang() {
        let w = window(MaintenanceStrategy::Cron {
            expression: "30 23 * * *".to_string(),
            duration_minutes: 60,
        });
        let ranges = w.resolve_ranges(utc(2024, 1, 2, 0, 0), utc(2024, 1, 3, 0, 0)).unwrap();
        assert_eq!(
            ranges,
            vec![
                // Started the previous evening, still running at the query start
                TimeRange::new(utc(2024, 1, 2, 0, 0), utc(2024, 1, 2, 0, 30)),
                TimeRange::new(utc(2024, 1, 2, 23, 30), utc(2024, 1, 3, 0, 0)),
            ]
        );

        let bad = window(MaintenanceStrategy::Cron {
            expression: "not cron".to_string(),
            duration_minutes: 5,
        });
        assert!(matches!(
            bad.resolve_ranges(utc(2024, 1, 2, 0, 0), utc(2024, 1, 3, 0, 0)),
            Err(MaintenanceError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_rrule_weekly_byday_with_count() {
        // 2024-01-01 is a Monday
        let w = window(MaintenanceStrategy::Rrule {
            rule: "RRULE:FREQ=WEEKLY;BYDAY=MO,WE;COUNT=3".to_string(),
            dtstart: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_time(hm(4, 0)),
            duration_minutes: 15,
        });
        let ranges = w.resolve_ranges(utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0)).unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| r.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 1, 1, 4, 0), utc(2024, 1, 3, 4, 0), utc(2024, 1, 8, 4, 0)]
        );
    }

    #[test]
    fn test_rrule_monthly_interval_until() {
        let w = window(MaintenanceStrategy::Rrule {
            rule: "FREQ=MONTHLY;INTERVAL=2;UNTIL=20240601T000000Z".to_string(),
            dtstart: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_time(hm(3, 0)),
            duration_minutes: 60,
        });
        let ranges = w.resolve_ranges(utc(2024, 1, 1, 0, 0), utc(2024, 12, 31, 0, 0)).unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| r.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 1, 15, 3, 0), utc(2024, 3, 15, 3, 0), utc(2024, 5, 15, 3, 0)]
        );
    }

    #[test]
    fn test_rrule_parse_errors() {
        assert!(RecurrenceRule::parse("INTERVAL=2").is_err());
        assert!(RecurrenceRule::parse("FREQ=YEARLY").is_err());
        assert!(RecurrenceRule::parse("FREQ=DAILY;BYDAY=XX").is_err());
        assert!(RecurrenceRule::parse("FREQ=DAILY;INTERVAL=0").is_err());
    }

    #[test]
    fn test_localize_dst_gap_and_overlap() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 2024-03-31 02:30 does not exist in Berlin
        let gap = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_time(hm(2, 30));
        assert_eq!(localize(tz, gap), utc(2024, 3, 31, 1, 30));
        // 2024-10-27 02:30 happens twice; the earlier (CEST) one wins
        let overlap = NaiveDate::from_ymd_opt(2024, 10, 27).unwrap().and_time(hm(2, 30));
        assert_eq!(localize(tz, overlap), utc(2024, 10, 27, 0, 30));
    }

    #[test]
    fn test_invalid_timezone() {
        let mut w = window(MaintenanceStrategy::Single {
            starts_at: utc(2024, 1, 1, 0, 0),
            ends_at: utc(2024, 1, 1, 1, 0),
        });
        w.timezone = "Mars/Olympus".to_string();
        assert!(matches!(
            w.resolve_ranges(utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0)),
            Err(MaintenanceError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_overlap_and_active() {
        let w = window(MaintenanceStrategy::Single {
            starts_at: utc(2024, 1, 1, 10, 0),
            ends_at: utc(2024, 1, 1, 11, 0),
        });
        assert!(w.is_active_at(utc(2024, 1, 1, 10, 30)).unwrap());
        assert!(!w.is_active_at(utc(2024, 1, 1, 11, 0)).unwrap());

        let ranges = resolve_all(&[w], utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0));
        let day = TimeRange::new(utc(2024, 1, 1, 10, 30), utc(2024, 1, 2, 0, 0));
        assert_eq!(overlap_seconds(&ranges, day), 1800);
    }
}
