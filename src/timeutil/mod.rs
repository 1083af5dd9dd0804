use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid range: 'from' must be before 'to'")]
    InvalidRange,
    #[error("invalid interval: must be greater than 0")]
    InvalidInterval,
}

/// One request window produced by [`chunk_time_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChunk {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Partition `[from, to)` into windows of `interval * max_periods` length.
///
/// Consecutive starts advance by `interval * (max_periods - overlay_periods)`
/// so each window re-covers the tail of the previous one; rows in the overlap
/// are re-fetched and idempotently overwritten, which closes off-by-one holes
/// at window boundaries. The final window is clamped to `to`.
pub fn chunk_time_range(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval: Duration,
    max_periods: i64,
    overlay_periods: i64,
) -> Result<Vec<TimeChunk>, ChunkError> {
    if from >= to {
        return Err(ChunkError::InvalidRange);
    }
    if interval <= Duration::zero() {
        return Err(ChunkError::InvalidInterval);
    }

    let max_duration = interval * max_periods as i32;
    let overlay = interval * overlay_periods as i32;

    let mut chunks = Vec::new();
    let mut start = from;
    while start < to {
        let end = (start + max_duration).min(to);
        chunks.push(TimeChunk { from: start, to: end });
        start = start + max_duration - overlay;
    }

    Ok(chunks)
}

pub fn millis_to_duration(millis: i64) -> Duration {
    Duration::milliseconds(millis)
}

/// Convert unix milliseconds into a UTC instant.
pub fn unix_millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

pub fn datetime_to_unix_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Truncate an instant to 00:00:00 UTC of the same day.
pub fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// True when the instant is past the start of the current UTC day.
pub fn is_today_or_future(t: DateTime<Utc>) -> bool {
    t > start_of_day(Utc::now())
}

pub fn exceeds_diff_in_hours(t1: DateTime<Utc>, t2: DateTime<Utc>, hours: i64) -> bool {
    t2 - t1 > Duration::hours(hours)
}

// ── Elapsed-time logging ──────────────────────────────────────────────────────

/// A simple wall-clock timer for logging elapsed time.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("starting: {}", label);
        Self { label, start: Instant::now() }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("finished: {} (took {:.2?})", self.label, self.start.elapsed());
    }
}

/// Format a large integer with thousands separators.
pub fn fmt_number(n: i64) -> String {
    let s = n.abs().to_string();
    let mut result = String::new();
    for (i, ch) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn chunk_ten_hours_by_three_with_one_overlay() {
        // 1h interval, 3 periods per window, 1 period of overlay: starts
        // advance by 2h, the final window is clamped to the range end.
        let from = utc(2024, 1, 1, 0, 0);
        let to = utc(2024, 1, 1, 10, 0);
        let chunks = chunk_time_range(from, to, Duration::hours(1), 3, 1).unwrap();

        let expected = [
            (utc(2024, 1, 1, 0, 0), utc(2024, 1, 1, 3, 0)),
            (utc(2024, 1, 1, 2, 0), utc(2024, 1, 1, 5, 0)),
            (utc(2024, 1, 1, 4, 0), utc(2024, 1, 1, 7, 0)),
            (utc(2024, 1, 1, 6, 0), utc(2024, 1, 1, 9, 0)),
            (utc(2024, 1, 1, 8, 0), utc(2024, 1, 1, 10, 0)),
        ];
        assert_eq!(chunks.len(), expected.len());
        for (chunk, (f, t)) in chunks.iter().zip(expected) {
            assert_eq!((chunk.from, chunk.to), (f, t));
        }
    }

    #[test]
    fn chunk_windows_cover_range_and_overlap() {
        let from = utc(2024, 3, 1, 0, 0);
        let to = utc(2024, 3, 20, 0, 0);
        let interval = Duration::minutes(15);
        let overlay_periods = 10;
        let chunks = chunk_time_range(from, to, interval, 500, overlay_periods).unwrap();

        // Union covers [from, to): consecutive windows may not leave holes.
        assert_eq!(chunks.first().unwrap().from, from);
        assert_eq!(chunks.last().unwrap().to, to);
        for pair in chunks.windows(2) {
            assert!(pair[1].from < pair[0].to, "windows must overlap");
            // Interior windows overlap by exactly overlay * interval.
            assert_eq!(pair[0].to - pair[1].from, interval * overlay_periods as i32);
        }
    }

    #[test]
    fn chunk_smaller_than_one_window() {
        // A 2h gap chunked with 500-period windows collapses to one chunk.
        let from = utc(2024, 1, 1, 11, 0);
        let to = utc(2024, 1, 1, 13, 0);
        let chunks = chunk_time_range(from, to, Duration::hours(1), 500, 10).unwrap();
        assert_eq!(chunks, vec![TimeChunk { from, to }]);
    }

    #[test]
    fn chunk_rejects_bad_input() {
        let t = utc(2024, 1, 1, 0, 0);
        assert_eq!(
            chunk_time_range(t, t, Duration::hours(1), 3, 1),
            Err(ChunkError::InvalidRange)
        );
        assert_eq!(
            chunk_time_range(t + Duration::hours(1), t, Duration::hours(1), 3, 1),
            Err(ChunkError::InvalidRange)
        );
        assert_eq!(
            chunk_time_range(t, t + Duration::hours(1), Duration::zero(), 3, 1),
            Err(ChunkError::InvalidInterval)
        );
    }

    #[test]
    fn start_of_day_truncates() {
        let t = Utc.with_ymd_and_hms(2024, 6, 15, 17, 45, 12).unwrap();
        assert_eq!(start_of_day(t), utc(2024, 6, 15, 0, 0));
    }

    #[test]
    fn today_or_future_checks() {
        assert!(is_today_or_future(Utc::now()));
        assert!(is_today_or_future(Utc::now() + Duration::days(2)));
        assert!(!is_today_or_future(Utc::now() - Duration::days(2)));
    }

    #[test]
    fn millis_roundtrip() {
        let t = utc(2024, 1, 1, 12, 0);
        assert_eq!(unix_millis_to_datetime(datetime_to_unix_millis(t)), t);
        assert_eq!(millis_to_duration(900_000), Duration::minutes(15));
    }

    #[test]
    fn diff_in_hours() {
        let t = utc(2024, 1, 1, 0, 0);
        assert!(exceeds_diff_in_hours(t, t + Duration::hours(3), 2));
        assert!(!exceeds_diff_in_hours(t, t + Duration::hours(2), 2));
    }

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
    }
}
