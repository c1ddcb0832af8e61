//! Pure scheduling math: cron evaluation and retry backoff.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::MonqueError;

/// Exponent ceiling for the backoff computation; keeps the shift well inside
/// `u32` even for absurd fail counts.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Compute the next instant at or after `from` at which `expr` fires.
///
/// Classic five-field expressions are accepted alongside seconds-resolution
/// six/seven-field ones; an expression with no upcoming occurrence is
/// reported as invalid.
pub fn next_after(expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, MonqueError> {
    let normalized = normalize(expr);
    let schedule = Schedule::from_str(&normalized).map_err(|_| MonqueError::InvalidCron {
        expr: expr.to_string(),
    })?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| MonqueError::InvalidCron {
            expr: expr.to_string(),
        })
}

/// Five-field classic cron gets a zero seconds column prepended so that
/// `0 * * * *` means "on the hour" rather than failing to parse.
fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

/// Delay before the next attempt after the `n`-th consecutive failure:
/// `min(2^n * base, cap)`.
pub fn retry_delay(fail_count: u32, base: Duration, cap: Option<Duration>) -> Duration {
    let exponent = fail_count.min(MAX_BACKOFF_EXPONENT);
    let delay = base.saturating_mul(1u32 << exponent);
    match cap {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hourly_fires_on_the_hour() {
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap();
        let next = next_after("0 * * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap());

        let after_success = next_after("0 * * * *", next).unwrap();
        assert_eq!(
            after_success,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = next_after("30 0 * * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 30).unwrap());
    }

    #[test]
    fn garbage_is_invalid() {
        let from = Utc::now();
        let err = next_after("not a cron", from).unwrap_err();
        match err {
            MonqueError::InvalidCron { expr } => assert_eq!(expr, "not a cron"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(1, base, None), Duration::from_millis(200));
        assert_eq!(retry_delay(2, base, None), Duration::from_millis(400));
        assert_eq!(retry_delay(3, base, None), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_cap() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(2500);
        assert_eq!(retry_delay(1, base, Some(cap)), Duration::from_millis(2000));
        assert_eq!(retry_delay(2, base, Some(cap)), cap);
        assert_eq!(retry_delay(10, base, Some(cap)), cap);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(u64::MAX / 2);
        let delay = retry_delay(40, base, None);
        assert!(delay >= base);
    }
}
