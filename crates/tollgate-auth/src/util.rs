//! Small helpers shared by the services.

use time::{OffsetDateTime, PrimitiveDateTime};

/// Converts a configured duration, saturating instead of overflowing.
#[must_use]
pub fn to_time_duration(duration: std::time::Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}

/// Returns `at + lifespan`, saturating at the latest representable instant.
#[must_use]
pub fn after(at: OffsetDateTime, lifespan: std::time::Duration) -> OffsetDateTime {
    at.checked_add(to_time_duration(lifespan))
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

/// Flush cutoff `min(not_after, now - lifespan)`.
///
/// Returns `None` when `now - lifespan` predates every representable
/// instant, in which case nothing is old enough to flush.
#[must_use]
pub fn flush_bound(
    not_after: OffsetDateTime,
    lifespan: std::time::Duration,
) -> Option<OffsetDateTime> {
    OffsetDateTime::now_utc()
        .checked_sub(to_time_duration(lifespan))
        .map(|floor| not_after.min(floor))
}

/// Splits a space-delimited scope or audience parameter.
#[must_use]
pub fn split_space(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}
