//! Persistence port for the worker. Everything the scheduler, logger and
//! ingestion pipeline need from a backend is expressed as one capability
//! trait so the concrete store can be swapped (DuckDB in production, the
//! in-memory variant in tests) without touching the callers.

pub mod duck;
pub mod memory;

pub use duck::DuckStorage;
pub use memory::MemStorage;

use crate::logger::{Log, LogFilter};
use crate::models::{
    Asset, AssetFilter, ExecutionFilter, ExecutionRecord, Gap, JobFilter, JobRecord, JobStatus,
    MarketKind, OhlcFilter, OhlcRow, UpsertLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("no rows to upsert")]
    EmptyUpsert,
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("invalid time range: 'from' date cannot be after 'to' date")]
    InvalidTimeRange,
}

/// Row counts and stored period of one ohlc collection, for the stats
/// command.
#[derive(Debug, Clone, Default)]
pub struct OhlcSummary {
    pub row_count: u64,
    pub first_start_time: Option<DateTime<Utc>>,
    pub last_start_time: Option<DateTime<Utc>>,
}

/// Capability surface over the backing store. All writes are idempotent
/// upserts keyed on natural identity; implementations are expected to be
/// safe to share across tasks.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Create every index the collections rely on. Called once at startup;
    /// failure here is fatal.
    async fn ensure_indexes(&self) -> Result<(), StorageError>;

    // ── Assets ────────────────────────────────────────────────────────────

    async fn count_assets(&self, kind: MarketKind, source: &str) -> Result<u64, StorageError>;

    /// Upsert on (source, symbol), atomic per row.
    async fn upsert_assets(
        &self,
        kind: MarketKind,
        rows: &[Asset],
    ) -> Result<UpsertLog, StorageError>;

    async fn list_assets(
        &self,
        kind: MarketKind,
        filter: &AssetFilter,
    ) -> Result<Vec<Asset>, StorageError>;

    // ── OHLC time-series ──────────────────────────────────────────────────

    /// Greatest `start_time` matching the filter, or `default` when nothing
    /// matches. An empty result is not an error; only a failed query is.
    async fn latest_start_time(
        &self,
        filter: &OhlcFilter,
        default: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StorageError>;

    /// Interior holes per distinct interval present under the filter.
    /// Intervals without gaps are omitted; an empty collection yields an
    /// empty map.
    async fn find_gaps(
        &self,
        filter: &OhlcFilter,
    ) -> Result<BTreeMap<i64, Vec<Gap>>, StorageError>;

    /// Bulk idempotent upsert on (symbol, start_time, interval). Rows are
    /// sorted by start_time ascending before writing so the returned
    /// [`UpsertLog`] reports a meaningful first/last period.
    async fn upsert_ohlc(
        &self,
        kind: MarketKind,
        rows: &[OhlcRow],
    ) -> Result<UpsertLog, StorageError>;

    async fn ohlc_summary(&self, kind: MarketKind) -> Result<OhlcSummary, StorageError>;

    // ── Job ledger ────────────────────────────────────────────────────────

    /// Upsert the job record on (source, name). `created_at` is only set on
    /// insert; `finished_at` is set iff the status is done. A done without
    /// an error clears any previously recorded error.
    #[allow(clippy::too_many_arguments)]
    async fn register_job(
        &self,
        source: &str,
        name: &str,
        frequency: &str,
        description: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError>;

    /// Mark every job of the source inactive. Called on orderly shutdown;
    /// returns the number of updated records.
    async fn set_jobs_inactive(&self, source: &str) -> Result<u64, StorageError>;

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    /// Executions matching the filter, ordered by initialized_at descending.
    async fn find_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    // ── Log stream ────────────────────────────────────────────────────────

    async fn append_log(&self, record: &Log) -> Result<(), StorageError>;

    /// Logs matching the filter, ordered by time descending.
    async fn find_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, StorageError>;

    async fn log_exists(&self, filter: &LogFilter) -> Result<bool, StorageError>;
}

/// Walk one interval group (sorted by start_time ascending, all records
/// sharing the same interval) and emit the interior holes. Leading and
/// trailing gaps relative to "now" are intentionally not synthesized; the
/// incremental scraper owns the trailing edge.
pub(crate) fn gaps_in_interval_group(records: &[(DateTime<Utc>, i64)]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    for pair in records.windows(2) {
        let (curr_start, interval) = pair[0];
        let (next_start, _) = pair[1];
        let expected_next = curr_start + chrono::Duration::milliseconds(interval);
        if expected_next < next_start {
            gaps.push(Gap { start_of_gap: expected_next, end_of_gap: next_start });
        }
    }
    gaps
}

/// Validate the optional time range of a filter.
pub(crate) fn check_time_range(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<(), StorageError> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(StorageError::InvalidTimeRange);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn interval_group_walk_finds_interior_holes() {
        const HOUR: i64 = 3_600_000;
        let rows = vec![(t(10), HOUR), (t(11), HOUR), (t(13), HOUR), (t(14), HOUR)];
        let gaps = gaps_in_interval_group(&rows);
        assert_eq!(gaps, vec![Gap { start_of_gap: t(12), end_of_gap: t(13) }]);
    }

    #[test]
    fn interval_group_walk_ignores_edges() {
        const HOUR: i64 = 3_600_000;
        // Single record and contiguous records produce nothing; the walk
        // never invents gaps before the first or after the last row.
        assert!(gaps_in_interval_group(&[(t(5), HOUR)]).is_empty());
        assert!(gaps_in_interval_group(&[(t(5), HOUR), (t(6), HOUR)]).is_empty());
        assert!(gaps_in_interval_group(&[]).is_empty());
    }

    #[test]
    fn time_range_check() {
        assert!(check_time_range(Some(t(2)), Some(t(1))).is_err());
        assert!(check_time_range(Some(t(1)), Some(t(2))).is_ok());
        assert!(check_time_range(None, Some(t(1))).is_ok());
        assert!(check_time_range(None, None).is_ok());
    }
}
