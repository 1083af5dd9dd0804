//! In-memory storage backend. Used by the test suite and handy for dry runs;
//! shares no state with the persistent variant.

use super::{check_time_range, gaps_in_interval_group, OhlcSummary, StorageError, StoragePort};
use crate::logger::{Log, LogFilter};
use crate::models::{
    Asset, AssetFilter, ExecutionFilter, ExecutionRecord, Gap, JobFilter, JobRecord, JobStatus,
    MarketKind, OhlcFilter, OhlcRow, UpsertLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

/// Ohlc identity key: (symbol, interval, start_time millis). Interval before
/// start keeps each series contiguous in iteration order.
type OhlcKey = (String, i64, i64);

#[derive(Default)]
struct Inner {
    assets: HashMap<MarketKind, Vec<Asset>>,
    ohlc: HashMap<MarketKind, BTreeMap<OhlcKey, OhlcRow>>,
    jobs: Vec<JobRecord>,
    executions: Vec<ExecutionRecord>,
    logs: Vec<Log>,
}

#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<Inner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_ohlc_filter(row: &OhlcRow, filter: &OhlcFilter) -> bool {
    if let Some(symbol) = &filter.symbol {
        if &row.symbol != symbol {
            return false;
        }
    }
    if let Some(interval) = filter.interval {
        if row.interval != interval {
            return false;
        }
    }
    true
}

fn matches_log_filter(log: &Log, filter: &LogFilter) -> bool {
    if let Some(from) = filter.from {
        if log.time < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if log.time > to {
            return false;
        }
    }
    if let Some(level) = filter.level {
        if log.level != level {
            return false;
        }
    }
    if let Some(source) = &filter.source {
        if log.source.as_deref() != Some(source.as_str()) {
            return false;
        }
    }
    if let Some(event) = &filter.event {
        if log.event.as_deref() != Some(event.as_str()) {
            return false;
        }
    }
    if let Some(event_id) = &filter.event_id {
        if log.event_id.as_deref() != Some(event_id.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl StoragePort for MemStorage {
    async fn ensure_indexes(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn count_assets(&self, kind: MarketKind, source: &str) -> Result<u64, StorageError> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .assets
            .get(&kind)
            .map(|rows| rows.iter().filter(|a| a.source == source).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn upsert_assets(
        &self,
        kind: MarketKind,
        rows: &[Asset],
    ) -> Result<UpsertLog, StorageError> {
        if rows.is_empty() {
            return Err(StorageError::EmptyUpsert);
        }
        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.assets.entry(kind).or_default();
        for row in rows {
            if row.symbol.is_empty() || row.source.is_empty() {
                return Err(StorageError::InvalidRow("symbol or source is empty".into()));
            }
            match existing
                .iter()
                .position(|a| a.source == row.source && a.symbol == row.symbol)
            {
                Some(idx) => existing[idx] = row.clone(),
                None => existing.push(row.clone()),
            }
        }
        Ok(UpsertLog::new(kind.asset_collection(), None, None, rows.len(), started))
    }

    async fn list_assets(
        &self,
        kind: MarketKind,
        filter: &AssetFilter,
    ) -> Result<Vec<Asset>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Asset> = inner
            .assets
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .filter(|a| filter.source.as_deref().map_or(true, |s| a.source == s))
                    .filter(|a| filter.status.as_deref().map_or(true, |s| a.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn latest_start_time(
        &self,
        filter: &OhlcFilter,
        default: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let latest = inner
            .ohlc
            .get(&filter.kind)
            .and_then(|rows| {
                rows.values()
                    .filter(|r| matches_ohlc_filter(r, filter))
                    .map(|r| r.start_time)
                    .max()
            });
        Ok(latest.unwrap_or(default))
    }

    async fn find_gaps(
        &self,
        filter: &OhlcFilter,
    ) -> Result<BTreeMap<i64, Vec<Gap>>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut groups: BTreeMap<i64, Vec<(DateTime<Utc>, i64)>> = BTreeMap::new();
        if let Some(rows) = inner.ohlc.get(&filter.kind) {
            for row in rows.values().filter(|r| matches_ohlc_filter(r, filter)) {
                groups
                    .entry(row.interval)
                    .or_default()
                    .push((row.start_time, row.interval));
            }
        }

        let mut out = BTreeMap::new();
        for (interval, mut records) in groups {
            records.sort_by_key(|(start, _)| *start);
            let gaps = gaps_in_interval_group(&records);
            if !gaps.is_empty() {
                out.insert(interval, gaps);
            }
        }
        Ok(out)
    }

    async fn upsert_ohlc(
        &self,
        kind: MarketKind,
        rows: &[OhlcRow],
    ) -> Result<UpsertLog, StorageError> {
        if rows.is_empty() {
            return Err(StorageError::EmptyUpsert);
        }
        let started = Instant::now();

        let mut sorted: Vec<OhlcRow> = rows.to_vec();
        sorted.sort_by_key(|r| r.start_time);
        let first = sorted.first().map(|r| r.start_time);
        let last = sorted.last().map(|r| r.start_time);

        let mut inner = self.inner.lock().unwrap();
        let store = inner.ohlc.entry(kind).or_default();
        for row in sorted {
            if row.symbol.is_empty() {
                return Err(StorageError::InvalidRow("symbol is empty".into()));
            }
            let key = (row.symbol.clone(), row.interval, row.start_time.timestamp_millis());
            store.insert(key, row);
        }

        Ok(UpsertLog::new(kind.ohlc_collection(), first, last, rows.len(), started))
    }

    async fn ohlc_summary(&self, kind: MarketKind) -> Result<OhlcSummary, StorageError> {
        let inner = self.inner.lock().unwrap();
        let rows = inner.ohlc.get(&kind);
        Ok(OhlcSummary {
            row_count: rows.map(|r| r.len()).unwrap_or(0) as u64,
            first_start_time: rows.and_then(|r| r.values().map(|v| v.start_time).min()),
            last_start_time: rows.and_then(|r| r.values().map(|v| v.start_time).max()),
        })
    }

    async fn register_job(
        &self,
        source: &str,
        name: &str,
        frequency: &str,
        description: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let (error_text, exited_with_error) = match error {
            Some(err) => (err.to_string(), true),
            None => (String::new(), false),
        };
        let finished_at = (status == JobStatus::Done).then_some(now);

        match inner
            .jobs
            .iter()
            .position(|j| j.source == source && j.name == name)
        {
            Some(idx) => {
                let job = &mut inner.jobs[idx];
                job.status = status;
                job.frequency = frequency.to_string();
                job.description = description.to_string();
                job.error = error_text;
                job.exited_with_error = exited_with_error;
                job.updated_at = now;
                if let Some(finished) = finished_at {
                    job.finished_at = Some(finished);
                }
            }
            None => inner.jobs.push(JobRecord {
                source: source.to_string(),
                name: name.to_string(),
                status,
                frequency: frequency.to_string(),
                description: description.to_string(),
                error: error_text,
                exited_with_error,
                created_at: now,
                updated_at: now,
                finished_at,
            }),
        }
        Ok(())
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|j| filter.source.as_deref().map_or(true, |s| j.source == s))
            .filter(|j| filter.name.as_deref().map_or(true, |n| j.name == n))
            .cloned()
            .collect())
    }

    async fn set_jobs_inactive(&self, source: &str) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let mut changed = 0;
        for job in inner.jobs.iter_mut().filter(|j| j.source == source) {
            job.status = JobStatus::Inactive;
            job.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        self.inner.lock().unwrap().executions.push(record.clone());
        Ok(())
    }

    async fn find_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<ExecutionRecord> = inner
            .executions
            .iter()
            .filter(|e| filter.from.map_or(true, |from| e.initialized_at >= from))
            .filter(|e| filter.to.map_or(true, |to| e.initialized_at <= to))
            .filter(|e| filter.source.as_deref().map_or(true, |s| e.source == s))
            .filter(|e| filter.name.as_deref().map_or(true, |n| e.name == n))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.initialized_at.cmp(&a.initialized_at));

        let skip = filter.skip.unwrap_or(0);
        let limit = filter.limit.unwrap_or(ExecutionFilter::DEFAULT_LIMIT);
        Ok(out.into_iter().skip(skip).take(limit).collect())
    }

    async fn append_log(&self, record: &Log) -> Result<(), StorageError> {
        self.inner.lock().unwrap().logs.push(record.clone());
        Ok(())
    }

    async fn find_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Log> = inner
            .logs
            .iter()
            .filter(|l| matches_log_filter(l, filter))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.time.cmp(&a.time));

        let skip = filter.skip.unwrap_or(0);
        let limit = filter.limit.unwrap_or(LogFilter::DEFAULT_LIMIT);
        Ok(out.into_iter().skip(skip).take(limit).collect())
    }

    async fn log_exists(&self, filter: &LogFilter) -> Result<bool, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.logs.iter().any(|l| matches_log_filter(l, filter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use crate::models::Ohlc;
    use chrono::{Duration, TimeZone};

    const HOUR_MS: i64 = 3_600_000;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn row(symbol: &str, start: DateTime<Utc>, interval: i64) -> OhlcRow {
        OhlcRow::new(symbol, start, interval, Ohlc::new(1.0, 2.0, 0.5, 1.5, 10.0)).unwrap()
    }

    fn log_at(time: DateTime<Utc>, event_id: &str) -> Log {
        Log {
            time,
            level: LogLevel::Info,
            message: "m".into(),
            source: None,
            event: None,
            event_id: Some(event_id.into()),
            fields: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_identity() {
        let store = MemStorage::new();
        let rows = vec![row("BTCUSDT", t(1), HOUR_MS)];
        store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();
        store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();

        let summary = store.ohlc_summary(MarketKind::Spot).await.unwrap();
        assert_eq!(summary.row_count, 1);
    }

    #[tokio::test]
    async fn upsert_reports_sorted_period() {
        let store = MemStorage::new();
        // Deliberately unsorted input.
        let rows = vec![
            row("BTCUSDT", t(5), HOUR_MS),
            row("BTCUSDT", t(2), HOUR_MS),
            row("BTCUSDT", t(9), HOUR_MS),
        ];
        let log = store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();
        assert_eq!(log.first_start_time, Some(t(2)));
        assert_eq!(log.last_start_time, Some(t(9)));
        assert_eq!(log.row_count, 3);
        assert_eq!(log.destination, "crypto_spot_ohlc");
    }

    #[tokio::test]
    async fn empty_upsert_is_an_error() {
        let store = MemStorage::new();
        assert!(matches!(
            store.upsert_ohlc(MarketKind::Spot, &[]).await,
            Err(StorageError::EmptyUpsert)
        ));
    }

    #[tokio::test]
    async fn latest_start_time_defaults_on_empty() {
        let store = MemStorage::new();
        let default = t(0);
        let filter = OhlcFilter::series(MarketKind::Spot, "BTCUSDT", HOUR_MS);
        assert_eq!(store.latest_start_time(&filter, default).await.unwrap(), default);

        let rows = vec![row("BTCUSDT", t(3), HOUR_MS), row("BTCUSDT", t(7), HOUR_MS)];
        store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();
        assert_eq!(store.latest_start_time(&filter, default).await.unwrap(), t(7));

        // A different symbol still sees the default.
        let other = OhlcFilter::series(MarketKind::Spot, "ETHUSDT", HOUR_MS);
        assert_eq!(store.latest_start_time(&other, default).await.unwrap(), default);
    }

    #[tokio::test]
    async fn find_gaps_detects_and_closes() {
        let store = MemStorage::new();
        let filter = OhlcFilter::series(MarketKind::Spot, "BTCUSDT", HOUR_MS);
        let rows: Vec<OhlcRow> = [10, 11, 13, 14]
            .iter()
            .map(|h| row("BTCUSDT", t(*h), HOUR_MS))
            .collect();
        store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();

        let gaps = store.find_gaps(&filter).await.unwrap();
        assert_eq!(
            gaps.get(&HOUR_MS),
            Some(&vec![Gap { start_of_gap: t(12), end_of_gap: t(13) }])
        );

        // Upserting the missing row makes find_gaps idempotently empty.
        store
            .upsert_ohlc(MarketKind::Spot, &[row("BTCUSDT", t(12), HOUR_MS)])
            .await
            .unwrap();
        assert!(store.find_gaps(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_gaps_empty_collection_is_empty_map() {
        let store = MemStorage::new();
        let filter = OhlcFilter::series(MarketKind::Spot, "BTCUSDT", HOUR_MS);
        assert!(store.find_gaps(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_job_done_without_error_clears_previous_error() {
        let store = MemStorage::new();
        store
            .register_job("pooler", "job-a", "@every 30s", "", JobStatus::Running, None)
            .await
            .unwrap();
        store
            .register_job("pooler", "job-a", "@every 30s", "", JobStatus::Done, Some("boom"))
            .await
            .unwrap();

        let job = &store.find_jobs(&JobFilter::default()).await.unwrap()[0];
        assert!(job.exited_with_error);
        assert_eq!(job.error, "boom");
        assert!(job.finished_at.is_some());

        store
            .register_job("pooler", "job-a", "@every 30s", "", JobStatus::Done, None)
            .await
            .unwrap();
        let job = &store.find_jobs(&JobFilter::default()).await.unwrap()[0];
        assert!(!job.exited_with_error);
        assert!(job.error.is_empty());
    }

    #[tokio::test]
    async fn register_job_keeps_created_at_on_update() {
        let store = MemStorage::new();
        store
            .register_job("pooler", "job-a", "@every 30s", "", JobStatus::Initialized, None)
            .await
            .unwrap();
        let created = store.find_jobs(&JobFilter::default()).await.unwrap()[0].created_at;

        store
            .register_job("pooler", "job-a", "@every 30s", "", JobStatus::Running, None)
            .await
            .unwrap();
        let job = &store.find_jobs(&JobFilter::default()).await.unwrap()[0];
        assert_eq!(job.created_at, created);
        assert_eq!(job.status, JobStatus::Running);
        // running is not a terminal transition, finished_at stays unset
        assert!(job.finished_at.is_none());
    }

    #[tokio::test]
    async fn set_jobs_inactive_only_touches_the_source() {
        let store = MemStorage::new();
        store
            .register_job("pooler", "a", "@every 1s", "", JobStatus::Done, None)
            .await
            .unwrap();
        store
            .register_job("other", "b", "@every 1s", "", JobStatus::Done, None)
            .await
            .unwrap();

        assert_eq!(store.set_jobs_inactive("pooler").await.unwrap(), 1);
        let jobs = store.find_jobs(&JobFilter::default()).await.unwrap();
        let a = jobs.iter().find(|j| j.name == "a").unwrap();
        let b = jobs.iter().find(|j| j.name == "b").unwrap();
        assert_eq!(a.status, JobStatus::Inactive);
        assert_eq!(b.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn executions_sorted_desc_with_default_limit() {
        let store = MemStorage::new();
        for i in 0..250 {
            let rec = ExecutionRecord::new(
                "pooler",
                "job-a",
                t(0) + Duration::minutes(i),
                None,
            );
            store.append_execution(&rec).await.unwrap();
        }

        let out = store.find_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(out.len(), ExecutionFilter::DEFAULT_LIMIT);
        assert!(out.windows(2).all(|w| w[0].initialized_at >= w[1].initialized_at));

        let filtered = store
            .find_executions(&ExecutionFilter {
                from: Some(t(0)),
                to: Some(t(0) + Duration::minutes(9)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 10);

        assert!(matches!(
            store
                .find_executions(&ExecutionFilter {
                    from: Some(t(2)),
                    to: Some(t(1)),
                    ..Default::default()
                })
                .await,
            Err(StorageError::InvalidTimeRange)
        ));
    }

    #[tokio::test]
    async fn log_filter_by_event_id_limit_and_order() {
        let store = MemStorage::new();
        for i in 0..10 {
            store
                .append_log(&log_at(t(0) + Duration::minutes(i), "abc"))
                .await
                .unwrap();
        }
        store.append_log(&log_at(t(5), "other")).await.unwrap();

        let out = store
            .find_logs(&LogFilter {
                event_id: Some("abc".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|l| l.event_id.as_deref() == Some("abc")));
        assert!(out.windows(2).all(|w| w[0].time >= w[1].time));

        assert!(store
            .log_exists(&LogFilter { event_id: Some("other".into()), ..Default::default() })
            .await
            .unwrap());
        assert!(!store
            .log_exists(&LogFilter { event_id: Some("missing".into()), ..Default::default() })
            .await
            .unwrap());
    }
}
