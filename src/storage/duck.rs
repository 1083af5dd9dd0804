//! DuckDB-backed storage. One file on disk, schema applied on open, every
//! write an `ON CONFLICT` upsert keyed on natural identity.

use super::{check_time_range, gaps_in_interval_group, OhlcSummary, StorageError, StoragePort};
use crate::logger::{Log, LogFilter, LogLevel};
use crate::models::{
    Asset, AssetFilter, ExecutionFilter, ExecutionRecord, Gap, JobFilter, JobRecord, JobStatus,
    MarketKind, Ohlc, OhlcFilter, OhlcRow, UpsertLog,
};
use crate::timeutil::{datetime_to_unix_millis, unix_millis_to_datetime};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS crypto_spot_asset (
    source        VARCHAR NOT NULL,
    symbol        VARCHAR NOT NULL,
    status        VARCHAR NOT NULL,
    base_asset    VARCHAR NOT NULL DEFAULT '',
    quote_asset   VARCHAR NOT NULL DEFAULT '',
    contract_type VARCHAR,
    onboard_date  BIGINT,
    updated_at    BIGINT NOT NULL,
    PRIMARY KEY (source, symbol)
);

CREATE TABLE IF NOT EXISTS crypto_futures_asset (
    source        VARCHAR NOT NULL,
    symbol        VARCHAR NOT NULL,
    status        VARCHAR NOT NULL,
    base_asset    VARCHAR NOT NULL DEFAULT '',
    quote_asset   VARCHAR NOT NULL DEFAULT '',
    contract_type VARCHAR,
    onboard_date  BIGINT,
    updated_at    BIGINT NOT NULL,
    PRIMARY KEY (source, symbol)
);

CREATE TABLE IF NOT EXISTS crypto_spot_ohlc (
    symbol            VARCHAR NOT NULL,
    start_time        BIGINT  NOT NULL,
    "interval"        BIGINT  NOT NULL,
    open              DOUBLE  NOT NULL,
    high              DOUBLE  NOT NULL,
    low               DOUBLE  NOT NULL,
    close             DOUBLE  NOT NULL,
    volume            DOUBLE  NOT NULL,
    base_asset_volume DOUBLE,
    trade_count       BIGINT,
    PRIMARY KEY (symbol, start_time, "interval")
);

CREATE TABLE IF NOT EXISTS crypto_futures_ohlc (
    symbol            VARCHAR NOT NULL,
    start_time        BIGINT  NOT NULL,
    "interval"        BIGINT  NOT NULL,
    open              DOUBLE  NOT NULL,
    high              DOUBLE  NOT NULL,
    low               DOUBLE  NOT NULL,
    close             DOUBLE  NOT NULL,
    volume            DOUBLE  NOT NULL,
    base_asset_volume DOUBLE,
    trade_count       BIGINT,
    PRIMARY KEY (symbol, start_time, "interval")
);

CREATE TABLE IF NOT EXISTS cron_list (
    source            VARCHAR NOT NULL,
    name              VARCHAR NOT NULL,
    status            VARCHAR NOT NULL,
    frequency         VARCHAR NOT NULL,
    description       VARCHAR NOT NULL DEFAULT '',
    error             VARCHAR NOT NULL DEFAULT '',
    exited_with_error BOOLEAN NOT NULL DEFAULT false,
    created_at        BIGINT  NOT NULL,
    updated_at        BIGINT  NOT NULL,
    finished_at       BIGINT,
    PRIMARY KEY (source, name)
);

CREATE TABLE IF NOT EXISTS cron_history (
    source            VARCHAR NOT NULL,
    name              VARCHAR NOT NULL,
    initialized_at    BIGINT  NOT NULL,
    finished_at       BIGINT  NOT NULL,
    execution_time_ms BIGINT  NOT NULL,
    error             VARCHAR NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS logs (
    "time"   BIGINT   NOT NULL,
    level    SMALLINT NOT NULL,
    message  VARCHAR  NOT NULL,
    source   VARCHAR,
    event    VARCHAR,
    event_id VARCHAR,
    fields   VARCHAR
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_spot_ohlc_start      ON crypto_spot_ohlc (start_time);
CREATE INDEX IF NOT EXISTS idx_spot_ohlc_interval   ON crypto_spot_ohlc ("interval");
CREATE INDEX IF NOT EXISTS idx_spot_ohlc_symbol     ON crypto_spot_ohlc (symbol);
CREATE INDEX IF NOT EXISTS idx_spot_ohlc_series     ON crypto_spot_ohlc (start_time, symbol, "interval");
CREATE INDEX IF NOT EXISTS idx_fut_ohlc_start       ON crypto_futures_ohlc (start_time);
CREATE INDEX IF NOT EXISTS idx_fut_ohlc_interval    ON crypto_futures_ohlc ("interval");
CREATE INDEX IF NOT EXISTS idx_fut_ohlc_symbol      ON crypto_futures_ohlc (symbol);
CREATE INDEX IF NOT EXISTS idx_fut_ohlc_series      ON crypto_futures_ohlc (start_time, symbol, "interval");
CREATE INDEX IF NOT EXISTS idx_spot_asset_symbol    ON crypto_spot_asset (symbol);
CREATE INDEX IF NOT EXISTS idx_spot_asset_status    ON crypto_spot_asset (source, status);
CREATE INDEX IF NOT EXISTS idx_fut_asset_symbol     ON crypto_futures_asset (symbol);
CREATE INDEX IF NOT EXISTS idx_fut_asset_status     ON crypto_futures_asset (source, status);
CREATE INDEX IF NOT EXISTS idx_cron_list_name       ON cron_list (name);
CREATE INDEX IF NOT EXISTS idx_cron_list_status     ON cron_list (status);
CREATE INDEX IF NOT EXISTS idx_cron_hist_exec       ON cron_history (name, initialized_at, execution_time_ms);
CREATE INDEX IF NOT EXISTS idx_logs_time_level      ON logs ("time", level);
CREATE INDEX IF NOT EXISTS idx_logs_source          ON logs (source);
CREATE INDEX IF NOT EXISTS idx_logs_event           ON logs (event);
CREATE INDEX IF NOT EXISTS idx_logs_event_id        ON logs (event_id);
"#;

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct DuckStorage {
    conn: Mutex<Connection>,
}

impl DuckStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Query(format!("could not create {parent:?}: {e}")))?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn run_migrations(&self) -> Result<(), StorageError> {
        info!("applying storage schema");
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(DDL)?;
        Ok(())
    }
}

fn read_ohlc_row(row: &Row<'_>) -> duckdb::Result<OhlcRow> {
    let symbol: String = row.get(0)?;
    let start_ms: i64 = row.get(1)?;
    let interval: i64 = row.get(2)?;
    let ohlc = Ohlc::new(row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?);
    Ok(OhlcRow {
        symbol,
        start_time: unix_millis_to_datetime(start_ms),
        interval,
        ohlc,
        base_asset_volume: row.get(8)?,
        trade_count: row.get(9)?,
    })
}

fn read_asset_row(row: &Row<'_>) -> duckdb::Result<Asset> {
    Ok(Asset {
        source: row.get(0)?,
        symbol: row.get(1)?,
        status: row.get(2)?,
        base_asset: row.get(3)?,
        quote_asset: row.get(4)?,
        contract_type: row.get(5)?,
        onboard_date: row.get::<_, Option<i64>>(6)?.map(unix_millis_to_datetime),
        updated_at: unix_millis_to_datetime(row.get(7)?),
    })
}

fn read_log_row(row: &Row<'_>) -> duckdb::Result<Log> {
    let level_code: i16 = row.get(1)?;
    let fields_json: Option<String> = row.get(6)?;
    Ok(Log {
        time: unix_millis_to_datetime(row.get(0)?),
        level: LogLevel::try_from(level_code).unwrap_or(LogLevel::Info),
        message: row.get(2)?,
        source: row.get(3)?,
        event: row.get(4)?,
        event_id: row.get(5)?,
        fields: fields_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn millis_opt(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(datetime_to_unix_millis)
}

#[async_trait]
impl StoragePort for DuckStorage {
    async fn ensure_indexes(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(INDEXES)?;
        Ok(())
    }

    async fn count_assets(&self, kind: MarketKind, source: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE source = ?",
            kind.asset_collection()
        );
        let count: i64 = conn.prepare(&sql)?.query_row(params![source], |r| r.get(0))?;
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
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let sql = format!(
            r#"INSERT INTO {} (source, symbol, status, base_asset, quote_asset, contract_type, onboard_date, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (source, symbol) DO UPDATE SET
                   status        = excluded.status,
                   base_asset    = excluded.base_asset,
                   quote_asset   = excluded.quote_asset,
                   contract_type = excluded.contract_type,
                   onboard_date  = excluded.onboard_date,
                   updated_at    = excluded.updated_at"#,
            kind.asset_collection()
        );
        for row in rows {
            if row.symbol.is_empty() || row.source.is_empty() {
                return Err(StorageError::InvalidRow("symbol or source is empty".into()));
            }
            tx.execute(
                &sql,
                params![
                    row.source,
                    row.symbol,
                    row.status,
                    row.base_asset,
                    row.quote_asset,
                    row.contract_type,
                    millis_opt(row.onboard_date),
                    datetime_to_unix_millis(row.updated_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(UpsertLog::new(kind.asset_collection(), None, None, rows.len(), started))
    }

    async fn list_assets(
        &self,
        kind: MarketKind,
        filter: &AssetFilter,
    ) -> Result<Vec<Asset>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"SELECT source, symbol, status, base_asset, quote_asset, contract_type, onboard_date, updated_at
               FROM {}
               WHERE (?::VARCHAR IS NULL OR source = ?)
                 AND (?::VARCHAR IS NULL OR status = ?)
               ORDER BY symbol"#,
            kind.asset_collection()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![filter.source, filter.source, filter.status, filter.status],
            read_asset_row,
        )?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
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
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"SELECT MAX(start_time) FROM {}
               WHERE (?::VARCHAR IS NULL OR symbol = ?)
                 AND (?::BIGINT IS NULL OR "interval" = ?)"#,
            filter.kind.ohlc_collection()
        );
        let latest: Option<i64> = conn.prepare(&sql)?.query_row(
            params![filter.symbol, filter.symbol, filter.interval, filter.interval],
            |r| r.get(0),
        )?;
        Ok(latest.map(unix_millis_to_datetime).unwrap_or(default))
    }

    async fn find_gaps(
        &self,
        filter: &OhlcFilter,
    ) -> Result<BTreeMap<i64, Vec<Gap>>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let table = filter.kind.ohlc_collection();

        let distinct_sql = format!(
            r#"SELECT DISTINCT "interval" FROM {table}
               WHERE (?::VARCHAR IS NULL OR symbol = ?)
                 AND (?::BIGINT IS NULL OR "interval" = ?)
               ORDER BY "interval""#
        );
        let mut stmt = conn.prepare(&distinct_sql)?;
        let intervals: Vec<i64> = stmt
            .query_map(
                params![filter.symbol, filter.symbol, filter.interval, filter.interval],
                |r| r.get(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let group_sql = format!(
            r#"SELECT start_time, "interval" FROM {table}
               WHERE "interval" = ? AND (?::VARCHAR IS NULL OR symbol = ?)
               ORDER BY start_time ASC"#
        );
        let mut group_stmt = conn.prepare(&group_sql)?;

        let mut out = BTreeMap::new();
        for interval in intervals {
            let records: Vec<(DateTime<Utc>, i64)> = group_stmt
                .query_map(params![interval, filter.symbol, filter.symbol], |r| {
                    Ok((unix_millis_to_datetime(r.get(0)?), r.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
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

        let mut sorted: Vec<&OhlcRow> = rows.iter().collect();
        sorted.sort_by_key(|r| r.start_time);
        let first = sorted.first().map(|r| r.start_time);
        let last = sorted.last().map(|r| r.start_time);

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let sql = format!(
            r#"INSERT INTO {}
                   (symbol, start_time, "interval", open, high, low, close, volume, base_asset_volume, trade_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (symbol, start_time, "interval") DO UPDATE SET
                   open              = excluded.open,
                   high              = excluded.high,
                   low               = excluded.low,
                   close             = excluded.close,
                   volume            = excluded.volume,
                   base_asset_volume = excluded.base_asset_volume,
                   trade_count       = excluded.trade_count"#,
            kind.ohlc_collection()
        );
        for row in &sorted {
            if row.symbol.is_empty() {
                return Err(StorageError::InvalidRow("symbol is empty".into()));
            }
            tx.execute(
                &sql,
                params![
                    row.symbol,
                    datetime_to_unix_millis(row.start_time),
                    row.interval,
                    row.ohlc.open,
                    row.ohlc.high,
                    row.ohlc.low,
                    row.ohlc.close,
                    row.ohlc.volume,
                    row.base_asset_volume,
                    row.trade_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(UpsertLog::new(kind.ohlc_collection(), first, last, rows.len(), started))
    }

    async fn ohlc_summary(&self, kind: MarketKind) -> Result<OhlcSummary, StorageError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT COUNT(*), MIN(start_time), MAX(start_time) FROM {}",
            kind.ohlc_collection()
        );
        let summary = conn.prepare(&sql)?.query_row([], |r| {
            Ok(OhlcSummary {
                row_count: r.get::<_, i64>(0)? as u64,
                first_start_time: r.get::<_, Option<i64>>(1)?.map(unix_millis_to_datetime),
                last_start_time: r.get::<_, Option<i64>>(2)?.map(unix_millis_to_datetime),
            })
        })?;
        Ok(summary)
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
        let now = datetime_to_unix_millis(Utc::now());
        let (error_text, exited_with_error) = match error {
            Some(err) => (err, true),
            None => ("", false),
        };
        let finished_at = (status == JobStatus::Done).then_some(now);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO cron_list
                   (source, name, status, frequency, description, error, exited_with_error, created_at, updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (source, name) DO UPDATE SET
                   status            = excluded.status,
                   frequency         = excluded.frequency,
                   description       = excluded.description,
                   error             = excluded.error,
                   exited_with_error = excluded.exited_with_error,
                   updated_at        = excluded.updated_at,
                   finished_at       = COALESCE(excluded.finished_at, cron_list.finished_at)"#,
            params![
                source,
                name,
                status.as_str(),
                frequency,
                description,
                error_text,
                exited_with_error,
                now,
                now,
                finished_at,
            ],
        )?;
        Ok(())
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT source, name, status, frequency, description, error, exited_with_error, created_at, updated_at, finished_at
               FROM cron_list
               WHERE (?::VARCHAR IS NULL OR source = ?)
                 AND (?::VARCHAR IS NULL OR name = ?)
               ORDER BY source, name"#,
        )?;
        let rows = stmt.query_map(
            params![filter.source, filter.source, filter.name, filter.name],
            |r| {
                let status: String = r.get(2)?;
                Ok(JobRecord {
                    source: r.get(0)?,
                    name: r.get(1)?,
                    status: JobStatus::parse(&status).unwrap_or(JobStatus::Initialized),
                    frequency: r.get(3)?,
                    description: r.get(4)?,
                    error: r.get(5)?,
                    exited_with_error: r.get(6)?,
                    created_at: unix_millis_to_datetime(r.get(7)?),
                    updated_at: unix_millis_to_datetime(r.get(8)?),
                    finished_at: r.get::<_, Option<i64>>(9)?.map(unix_millis_to_datetime),
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn set_jobs_inactive(&self, source: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE cron_list SET status = ?, updated_at = ? WHERE source = ?",
            params![
                JobStatus::Inactive.as_str(),
                datetime_to_unix_millis(Utc::now()),
                source
            ],
        )?;
        Ok(changed as u64)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO cron_history (source, name, initialized_at, finished_at, execution_time_ms, error)
               VALUES (?, ?, ?, ?, ?, ?)"#,
            params![
                record.source,
                record.name,
                datetime_to_unix_millis(record.initialized_at),
                datetime_to_unix_millis(record.finished_at),
                record.execution_time_ms,
                record.error,
            ],
        )?;
        Ok(())
    }

    async fn find_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT source, name, initialized_at, finished_at, execution_time_ms, error
               FROM cron_history
               WHERE (?::BIGINT IS NULL OR initialized_at >= ?)
                 AND (?::BIGINT IS NULL OR initialized_at <= ?)
                 AND (?::VARCHAR IS NULL OR source = ?)
                 AND (?::VARCHAR IS NULL OR name = ?)
               ORDER BY initialized_at DESC
               LIMIT ? OFFSET ?"#,
        )?;
        let from = millis_opt(filter.from);
        let to = millis_opt(filter.to);
        let limit = filter.limit.unwrap_or(ExecutionFilter::DEFAULT_LIMIT) as i64;
        let skip = filter.skip.unwrap_or(0) as i64;
        let rows = stmt.query_map(
            params![
                from,
                from,
                to,
                to,
                filter.source,
                filter.source,
                filter.name,
                filter.name,
                limit,
                skip
            ],
            |r| {
                Ok(ExecutionRecord {
                    source: r.get(0)?,
                    name: r.get(1)?,
                    initialized_at: unix_millis_to_datetime(r.get(2)?),
                    finished_at: unix_millis_to_datetime(r.get(3)?),
                    execution_time_ms: r.get(4)?,
                    error: r.get(5)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn append_log(&self, record: &Log) -> Result<(), StorageError> {
        let fields_json = record
            .fields
            .as_ref()
            .map(|f| serde_json::to_string(f).unwrap_or_default());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO logs ("time", level, message, source, event, event_id, fields)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                datetime_to_unix_millis(record.time),
                record.level.code(),
                record.message,
                record.source,
                record.event,
                record.event_id,
                fields_json,
            ],
        )?;
        Ok(())
    }

    async fn find_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT "time", level, message, source, event, event_id, fields
               FROM logs
               WHERE (?::BIGINT IS NULL OR "time" >= ?)
                 AND (?::BIGINT IS NULL OR "time" <= ?)
                 AND (?::SMALLINT IS NULL OR level = ?)
                 AND (?::VARCHAR IS NULL OR source = ?)
                 AND (?::VARCHAR IS NULL OR event = ?)
                 AND (?::VARCHAR IS NULL OR event_id = ?)
               ORDER BY "time" DESC
               LIMIT ? OFFSET ?"#,
        )?;
        let from = millis_opt(filter.from);
        let to = millis_opt(filter.to);
        let level = filter.level.map(|l| l.code());
        let limit = filter.limit.unwrap_or(LogFilter::DEFAULT_LIMIT) as i64;
        let skip = filter.skip.unwrap_or(0) as i64;
        let rows = stmt.query_map(
            params![
                from,
                from,
                to,
                to,
                level,
                level,
                filter.source,
                filter.source,
                filter.event,
                filter.event,
                filter.event_id,
                filter.event_id,
                limit,
                skip
            ],
            read_log_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn log_exists(&self, filter: &LogFilter) -> Result<bool, StorageError> {
        check_time_range(filter.from, filter.to)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT EXISTS (
                   SELECT 1 FROM logs
                   WHERE (?::BIGINT IS NULL OR "time" >= ?)
                     AND (?::BIGINT IS NULL OR "time" <= ?)
                     AND (?::SMALLINT IS NULL OR level = ?)
                     AND (?::VARCHAR IS NULL OR source = ?)
                     AND (?::VARCHAR IS NULL OR event = ?)
                     AND (?::VARCHAR IS NULL OR event_id = ?)
               )"#,
        )?;
        let from = millis_opt(filter.from);
        let to = millis_opt(filter.to);
        let level = filter.level.map(|l| l.code());
        let exists: bool = stmt.query_row(
            params![
                from,
                from,
                to,
                to,
                level,
                level,
                filter.source,
                filter.source,
                filter.event,
                filter.event,
                filter.event_id,
                filter.event_id,
            ],
            |r| r.get(0),
        )?;
        Ok(exists)
    }
}

// `read_ohlc_row` backs the range queries used by tests and debugging below.
impl DuckStorage {
    /// All rows of one series ordered by start_time, for inspection in tests
    /// and one-off debugging.
    pub fn ohlc_rows(
        &self,
        kind: MarketKind,
        symbol: &str,
        interval: i64,
    ) -> Result<Vec<OhlcRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"SELECT symbol, start_time, "interval", open, high, low, close, volume, base_asset_volume, trade_count
               FROM {} WHERE symbol = ? AND "interval" = ? ORDER BY start_time"#,
            kind.ohlc_collection()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![symbol, interval], read_ohlc_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ohlc;
    use chrono::TimeZone;

    const HOUR_MS: i64 = 3_600_000;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn row(symbol: &str, start: DateTime<Utc>, interval: i64) -> OhlcRow {
        OhlcRow::new(symbol, start, interval, Ohlc::new(1.0, 2.0, 0.5, 1.5, 10.0))
            .unwrap()
            .with_base_asset_volume(3.5)
            .with_trade_count(42)
    }

    async fn open_store() -> DuckStorage {
        let store = DuckStorage::open_in_memory().unwrap();
        store.ensure_indexes().await.unwrap();
        store
    }

    #[tokio::test]
    async fn ohlc_upsert_roundtrip_and_identity() {
        let store = open_store().await;
        let rows = vec![row("BTCUSDT", t(1), HOUR_MS), row("BTCUSDT", t(2), HOUR_MS)];
        let log = store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();
        assert_eq!(log.row_count, 2);
        assert_eq!(log.first_start_time, Some(t(1)));
        assert_eq!(log.last_start_time, Some(t(2)));

        // Re-upserting the same identity leaves a single row per candle.
        store.upsert_ohlc(MarketKind::Spot, &rows).await.unwrap();
        let stored = store.ohlc_rows(MarketKind::Spot, "BTCUSDT", HOUR_MS).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], rows[0]);
    }

    #[tokio::test]
    async fn latest_start_time_and_gaps() {
        let store = open_store().await;
        let filter = OhlcFilter::series(MarketKind::Futures, "ETHUSDT", HOUR_MS);
        assert_eq!(store.latest_start_time(&filter, t(0)).await.unwrap(), t(0));

        let rows: Vec<OhlcRow> = [10, 11, 13, 14]
            .iter()
            .map(|h| row("ETHUSDT", t(*h), HOUR_MS))
            .collect();
        store.upsert_ohlc(MarketKind::Futures, &rows).await.unwrap();

        assert_eq!(store.latest_start_time(&filter, t(0)).await.unwrap(), t(14));

        let gaps = store.find_gaps(&filter).await.unwrap();
        assert_eq!(
            gaps.get(&HOUR_MS),
            Some(&vec![Gap { start_of_gap: t(12), end_of_gap: t(13) }])
        );

        store
            .upsert_ohlc(MarketKind::Futures, &[row("ETHUSDT", t(12), HOUR_MS)])
            .await
            .unwrap();
        assert!(store.find_gaps(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assets_upsert_and_listing() {
        let store = open_store().await;
        let asset = Asset {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            status: "TRADING".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            updated_at: t(0),
            contract_type: None,
            onboard_date: None,
        };
        let halted = Asset { symbol: "XYZUSDT".into(), status: "BREAK".into(), ..asset.clone() };
        store
            .upsert_assets(MarketKind::Spot, &[asset.clone(), halted])
            .await
            .unwrap();

        assert_eq!(store.count_assets(MarketKind::Spot, "binance").await.unwrap(), 2);
        assert_eq!(store.count_assets(MarketKind::Futures, "binance").await.unwrap(), 0);

        let trading = store
            .list_assets(MarketKind::Spot, &AssetFilter::trading("binance"))
            .await
            .unwrap();
        assert_eq!(trading.len(), 1);
        assert_eq!(trading[0], asset);
    }

    #[tokio::test]
    async fn job_ledger_transitions() {
        let store = open_store().await;
        store
            .register_job("pooler", "spot-ohlc", "@every 30s", "d", JobStatus::Initialized, None)
            .await
            .unwrap();
        store
            .register_job("pooler", "spot-ohlc", "@every 30s", "d", JobStatus::Done, Some("x"))
            .await
            .unwrap();

        let jobs = store.find_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].exited_with_error);
        assert!(jobs[0].finished_at.is_some());

        // A clean done clears the error fields (and created_at is stable).
        let created = jobs[0].created_at;
        store
            .register_job("pooler", "spot-ohlc", "@every 30s", "d", JobStatus::Done, None)
            .await
            .unwrap();
        let jobs = store.find_jobs(&JobFilter::default()).await.unwrap();
        assert!(!jobs[0].exited_with_error);
        assert!(jobs[0].error.is_empty());
        assert_eq!(jobs[0].created_at, created);

        assert_eq!(store.set_jobs_inactive("pooler").await.unwrap(), 1);
        let jobs = store.find_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Inactive);
    }

    #[tokio::test]
    async fn executions_query() {
        let store = open_store().await;
        for i in 0..5 {
            let rec = ExecutionRecord::new(
                "pooler",
                if i % 2 == 0 { "a" } else { "b" },
                t(i),
                (i == 3).then_some("boom"),
            );
            store.append_execution(&rec).await.unwrap();
        }

        let all = store.find_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].initialized_at >= w[1].initialized_at));

        let only_a = store
            .find_executions(&ExecutionFilter { name: Some("a".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 3);

        let windowed = store
            .find_executions(&ExecutionFilter {
                from: Some(t(1)),
                to: Some(t(3)),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].initialized_at, t(3));
        assert_eq!(windowed[0].error, "boom");
    }

    #[tokio::test]
    async fn log_persistence_with_fields() {
        let store = open_store().await;
        let record = Log {
            time: t(6),
            level: LogLevel::Warn,
            message: "rate limited".into(),
            source: Some("pooler".into()),
            event: Some("binance".into()),
            event_id: Some("req-9".into()),
            fields: Some(crate::log_fields! { "status" => 429, "symbol" => "BTCUSDT" }),
        };
        store.append_log(&record).await.unwrap();

        let found = store
            .find_logs(&LogFilter {
                level: Some(LogLevel::Warn),
                event_id: Some("req-9".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], record);

        assert!(store
            .log_exists(&LogFilter { source: Some("pooler".into()), ..Default::default() })
            .await
            .unwrap());
        assert!(matches!(
            store
                .find_logs(&LogFilter { from: Some(t(2)), to: Some(t(1)), ..Default::default() })
                .await,
            Err(StorageError::InvalidTimeRange)
        ));
    }
}
