//! `jobforge validate-cron`: check an expression offline and preview it.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use jobforge_scheduler::{cron_parser, try_next_run, validate_timezone};

/// The next `count` fire times of `expression` in `timezone`, starting after `from`.
pub fn upcoming(
    expression: &str,
    timezone: &str,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    validate_timezone(timezone)?;
    let mut runs = Vec::with_capacity(count);
    let mut cursor = from;
    for _ in 0..count {
        let next = try_next_run(expression, timezone, cursor)?;
        if next == cron_parser::far_future() {
            break;
        }
        runs.push(next);
        cursor = next;
    }
    Ok(runs)
}

pub fn run(expression: &str, timezone: &str, count: usize) -> Result<()> {
    let normalized = cron_parser::normalize(expression)?;
    let tz = validate_timezone(timezone)?;
    let runs = upcoming(expression, timezone, Utc::now(), count)?;
    if runs.is_empty() && count > 0 {
        bail!("'{expression}' never fires");
    }

    println!("valid: {expression}");
    println!("evaluated as: {normalized} ({timezone})");
    for run in runs {
        println!("  {}  ({})", run.with_timezone(&tz).to_rfc3339(), run.to_rfc3339());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lists_consecutive_fire_times() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
        let runs = upcoming("*/15 * * * *", "UTC", from, 3).unwrap();
        assert_eq!(
            runs,
            vec![
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 45, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn rejects_bad_input() {
        let from = Utc::now();
        assert!(upcoming("bogus", "UTC", from, 1).is_err());
        assert!(upcoming("0 * * * *", "Mars/Olympus", from, 1).is_err());
    }
}
