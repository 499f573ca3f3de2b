//! Five-field cron expression parsing and next-run search.
//!
//! Each field expands to the explicit set of matching values; the next
//! fire time is found by scanning forward one minute at a time from the
//! minute after the reference, bounded to roughly a year.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Upper bound on the forward scan, in minutes (366 days).
const MAX_SCAN_MINUTES: u32 = 366 * 24 * 60;

/// A cron expression with every field expanded to its matching values.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday.
    days_of_week: Vec<u32>,
}

/// Parse `minute hour day-of-month month day-of-week`. Fields support
/// `*`, comma lists, ranges (`1-5`), and steps on `*` or a range
/// (`*/15`, `10-30/5`). Returns `None` for anything malformed.
pub(crate) fn parse_cron_expr(expr: &str) -> Option<CronExpr> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    Some(CronExpr {
        minutes: parse_field(fields[0], 0, 59)?,
        hours: parse_field(fields[1], 0, 23)?,
        days_of_month: parse_field(fields[2], 1, 31)?,
        months: parse_field(fields[3], 1, 12)?,
        days_of_week: parse_field(fields[4], 0, 6)?,
    })
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, step.parse::<u32>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            (lo.parse().ok()?, hi.parse().ok()?)
        } else {
            let value = base.parse().ok()?;
            (value, value)
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

/// First minute strictly after `after` whose wall-clock components are
/// all members of the expanded sets, or `None` within the scan bound.
pub(crate) fn next_cron_run(expr: &CronExpr, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut candidate = (after + Duration::minutes(1))
        .with_second(0)?
        .with_nanosecond(0)?;
    for _ in 0..MAX_SCAN_MINUTES {
        if expr.minutes.contains(&candidate.minute())
            && expr.hours.contains(&candidate.hour())
            && expr.days_of_month.contains(&candidate.day())
            && expr.months.contains(&candidate.month())
            && expr
                .days_of_week
                .contains(&candidate.weekday().num_days_from_sunday())
        {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}
