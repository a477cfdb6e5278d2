//! Cron expression validation and next-run computation.
//!
//! Accepts 5-field (min hour dom mon dow) and 6-field (sec …) syntax with
//! standard day-of-week numbering, evaluated in an IANA timezone.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

use jobforge_core::EngineError;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Returned by [`next_run`] when an expression or zone cannot be evaluated.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Rewrite `expr` into the 6-field form the evaluator understands.
pub fn normalize(expr: &str) -> Result<String, EngineError> {
    let invalid = |reason: String| EngineError::ScheduleInvalid(format!("'{expr}': {reason}"));
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let (seconds, rest) = match parts.len() {
        5 => ("0", &parts[..]),
        6 => (parts[0], &parts[1..]),
        n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
    };
    let dow = normalize_day_of_week(rest[4]).map_err(invalid)?;
    Ok(format!(
        "{seconds} {} {} {} {} {dow}",
        rest[0], rest[1], rest[2], rest[3]
    ))
}

/// Numeric day-of-week elements become day names, `0` and `7` both Sunday.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for element in field.split(',') {
        if element.is_empty() {
            return Err(format!("empty day-of-week element in '{field}'"));
        }
        let (range, step) = match element.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("step '{step}' is not numeric"))?;
                if step == 0 {
                    return Err("step must be > 0".to_string());
                }
                (range, Some(step))
            }
            None => (element, None),
        };
        if range == "*" || range == "?" {
            out.push(element.to_string());
            continue;
        }
        let bounds = match range.split_once('-') {
            Some((lo, hi)) => (lo.parse::<u32>().ok(), hi.parse::<u32>().ok()),
            None => {
                let v = range.parse::<u32>().ok();
                // `a/n` runs from `a` to the end of the week.
                (v, if step.is_some() { v.map(|_| 7) } else { v })
            }
        };
        let (lo, hi) = match bounds {
            (Some(lo), Some(hi)) => (lo, hi),
            // Named days go through untouched.
            _ => {
                out.push(element.to_string());
                continue;
            }
        };
        if lo > 7 || hi > 7 || lo > hi {
            return Err(format!("day-of-week '{range}' out of [0, 7]"));
        }
        let mut days: Vec<&str> = (lo..=hi)
            .step_by(step.unwrap_or(1) as usize)
            .map(|d| DAY_NAMES[(d % 7) as usize])
            .collect();
        days.dedup();
        for day in days {
            if !out.iter().any(|d| d == day) {
                out.push(day.to_string());
            }
        }
    }
    Ok(out.join(","))
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, EngineError> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::ScheduleInvalid(format!("'{expr}': {e}")))
}

pub fn validate_expression(expr: &str) -> bool {
    parse_schedule(expr).is_ok()
}

pub fn validate_timezone(timezone: &str) -> Result<Tz, EngineError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| EngineError::ScheduleInvalid(format!("unknown timezone '{timezone}'")))
}

/// First fire time strictly after `from`.
pub fn try_next_run(expr: &str, timezone: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    let schedule = parse_schedule(expr)?;
    let tz = validate_timezone(timezone)?;
    schedule
        .after(&from.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| EngineError::ScheduleInvalid(format!("'{expr}' never fires")))
}

/// Like [`try_next_run`], but a broken expression or zone yields [`far_future`].
pub fn next_run(expr: &str, timezone: &str, from: DateTime<Utc>) -> DateTime<Utc> {
    try_next_run(expr, timezone, from).unwrap_or_else(|e| {
        warn!(cron = %expr, timezone = %timezone, error = %e, "Unusable schedule; parking it");
        far_future()
    })
}
