use time::{Duration, OffsetDateTime};

/// Time source injected into the sweep, the config operations and the reports.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// `now - age`, or `None` when the result falls outside the supported calendar.
pub fn checked_before(now: OffsetDateTime, age: Duration) -> Option<OffsetDateTime> {
    now.checked_sub(age)
}

/// `now - days`, without panicking on absurd day counts.
pub fn checked_days_before(now: OffsetDateTime, days: i64) -> Option<OffsetDateTime> {
    let age = days.checked_mul(86_400).map(Duration::seconds)?;
    checked_before(now, age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_checked_days_before() {
        let now = datetime!(2026-05-10 12:00 UTC);
        assert_eq!(checked_days_before(now, 7), Some(datetime!(2026-05-03 12:00 UTC)));
        assert_eq!(checked_days_before(now, 10_000_000), None);
        assert_eq!(checked_days_before(now, i64::MAX), None);
    }
}
