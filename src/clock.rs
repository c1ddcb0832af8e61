//! Injectable wall clock.
//!
//! Every component reads time through a shared [`Clock`] so tests can pin or
//! advance the clock without sleeping. Production uses [`SystemClock`].

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert a `std::time::Duration` to a `chrono::Duration` without panicking
/// on out-of-range values.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = duration.as_millis().min(i64::MAX as u128) as i64;
    chrono::Duration::milliseconds(millis)
}
