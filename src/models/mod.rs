use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Market kind ───────────────────────────────────────────────────────────────

/// Which upstream market a row or asset belongs to. Each kind maps to its own
/// pair of collections so spot and futures series never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Futures,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Futures => "futures",
        }
    }

    pub fn ohlc_collection(&self) -> &'static str {
        match self {
            MarketKind::Spot => "crypto_spot_ohlc",
            MarketKind::Futures => "crypto_futures_ohlc",
        }
    }

    pub fn asset_collection(&self) -> &'static str {
        match self {
            MarketKind::Spot => "crypto_spot_asset",
            MarketKind::Futures => "crypto_futures_asset",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("symbol is empty")]
    EmptySymbol,
    #[error("interval must be greater than 0, got {0}")]
    InvalidInterval(i64),
    #[error("ohlc values must be finite")]
    NonFinitePrice,
    #[error("ohlc bounds violated: low <= open,close <= high expected")]
    PriceBounds,
    #[error("volume cannot be negative")]
    NegativeVolume,
}

// ── OHLC rows ─────────────────────────────────────────────────────────────────

/// Open, high, low, close and volume of one candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Ohlc {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { open, high, low, close, volume }
    }
}

/// One persisted candle. Identity is (symbol, start_time, interval); the
/// upsert path relies on it, which is what makes overlayed re-fetches safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcRow {
    pub symbol: String,
    /// Candle open time, always UTC.
    pub start_time: DateTime<Utc>,
    /// Candle resolution in milliseconds.
    pub interval: i64,
    #[serde(flatten)]
    pub ohlc: Ohlc,
    #[serde(rename = "bv", skip_serializing_if = "Option::is_none")]
    pub base_asset_volume: Option<f64>,
    #[serde(rename = "n", skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<i64>,
}

impl OhlcRow {
    pub fn new(
        symbol: impl Into<String>,
        start_time: DateTime<Utc>,
        interval: i64,
        ohlc: Ohlc,
    ) -> Result<Self, ValidationError> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if interval <= 0 {
            return Err(ValidationError::InvalidInterval(interval));
        }
        let vals = [ohlc.open, ohlc.high, ohlc.low, ohlc.close, ohlc.volume];
        if vals.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinitePrice);
        }
        if ohlc.low > ohlc.open
            || ohlc.low > ohlc.close
            || ohlc.high < ohlc.open
            || ohlc.high < ohlc.close
        {
            return Err(ValidationError::PriceBounds);
        }
        if ohlc.volume < 0.0 {
            return Err(ValidationError::NegativeVolume);
        }
        Ok(Self {
            symbol,
            start_time,
            interval,
            ohlc,
            base_asset_volume: None,
            trade_count: None,
        })
    }

    pub fn with_base_asset_volume(mut self, v: f64) -> Self {
        self.base_asset_volume = Some(v);
        self
    }

    pub fn with_trade_count(mut self, n: i64) -> Self {
        self.trade_count = Some(n);
        self
    }
}

impl fmt::Display for OhlcRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "symbol: {}, time: {}, interval: {}, o: {}, h: {}, l: {}, c: {}, v: {}",
            self.symbol,
            self.start_time,
            self.interval,
            self.ohlc.open,
            self.ohlc.high,
            self.ohlc.low,
            self.ohlc.close,
            self.ohlc.volume
        )
    }
}

// ── Assets ────────────────────────────────────────────────────────────────────

/// One tradeable instrument as reported by the upstream exchange listing.
/// Identity is (source, symbol); only assets with status `TRADING` are picked
/// up by the ohlc jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub source: String,
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboard_date: Option<DateTime<Utc>>,
}

pub const STATUS_TRADING: &str = "TRADING";

/// Filter for asset queries.
#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    pub source: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl AssetFilter {
    pub fn trading(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            status: Some(STATUS_TRADING.to_string()),
            limit: None,
        }
    }
}

/// Filter for ohlc time-series queries (latest start-time and gap lookups).
#[derive(Debug, Clone)]
pub struct OhlcFilter {
    pub kind: MarketKind,
    pub symbol: Option<String>,
    pub interval: Option<i64>,
}

impl OhlcFilter {
    pub fn series(kind: MarketKind, symbol: impl Into<String>, interval: i64) -> Self {
        Self { kind, symbol: Some(symbol.into()), interval: Some(interval) }
    }
}

// ── Gaps ──────────────────────────────────────────────────────────────────────

/// An interior hole in a time-series: no row exists in `[start_of_gap,
/// end_of_gap)` for the interval the gap was computed under. Derived, never
/// stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start_of_gap: DateTime<Utc>,
    pub end_of_gap: DateTime<Utc>,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start_of_gap.format("%Y-%m-%d %H:%M:%S"),
            self.end_of_gap.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

// ── Upsert reporting ──────────────────────────────────────────────────────────

/// Meta information about one bulk upsert, for log lines and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertLog {
    /// Collection the rows were written into.
    pub destination: String,
    pub first_start_time: Option<DateTime<Utc>>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub row_count: usize,
    pub elapsed_seconds: f64,
}

impl UpsertLog {
    pub fn new(
        destination: impl Into<String>,
        first_start_time: Option<DateTime<Utc>>,
        last_start_time: Option<DateTime<Utc>>,
        row_count: usize,
        started: std::time::Instant,
    ) -> Self {
        Self {
            destination: destination.into(),
            first_start_time,
            last_start_time,
            row_count,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        }
    }
}

impl fmt::Display for UpsertLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
        let fmt_time = |t: &Option<DateTime<Utc>>| match t {
            Some(t) => t.format(FORMAT).to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "upserted {} rows into {} from the period of {} to {} in {:.2} sec",
            self.row_count,
            self.destination,
            fmt_time(&self.first_start_time),
            fmt_time(&self.last_start_time),
            self.elapsed_seconds
        )
    }
}

// ── Job ledger records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initialized,
    Running,
    Done,
    Inactive,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(JobStatus::Initialized),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "inactive" => Some(JobStatus::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered cron job. Identity is (source, name); the record lives for
/// the process lifetime and is updated on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub source: String,
    pub name: String,
    pub status: JobStatus,
    pub frequency: String,
    pub description: String,
    pub error: String,
    pub exited_with_error: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub source: Option<String>,
    pub name: Option<String>,
}

/// One finished (or failed) tick of a job. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub source: String,
    pub name: String,
    pub initialized_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration of the tick in milliseconds.
    pub execution_time_ms: i64,
    pub error: String,
}

impl ExecutionRecord {
    pub fn new(
        source: impl Into<String>,
        name: impl Into<String>,
        initialized_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            source: source.into(),
            name: name.into(),
            initialized_at,
            finished_at,
            execution_time_ms: (finished_at - initialized_at).num_milliseconds(),
            error: error.unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl ExecutionFilter {
    /// Default page size for execution queries.
    pub const DEFAULT_LIMIT: usize = 200;
}

// ── Timeframes ────────────────────────────────────────────────────────────────

/// A named candle resolution together with the token the upstream api expects
/// in its `interval` url parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    pub url_param: &'static str,
    pub millis: i64,
}

const MIN_IN_MILLIS: i64 = 60 * 1000;

/// 97% of the upstream's 1000-candle request cap, as a multiplier on the
/// interval. Kept in integer math so the period is exact.
const MAX_REQ_CANDLES: i64 = 970;

impl Timeframe {
    pub const M1: Timeframe = Timeframe { url_param: "1m", millis: MIN_IN_MILLIS };
    pub const M5: Timeframe = Timeframe { url_param: "5m", millis: 5 * MIN_IN_MILLIS };
    pub const M15: Timeframe = Timeframe { url_param: "15m", millis: 15 * MIN_IN_MILLIS };
    pub const M30: Timeframe = Timeframe { url_param: "30m", millis: 30 * MIN_IN_MILLIS };
    pub const H1: Timeframe = Timeframe { url_param: "1h", millis: 60 * MIN_IN_MILLIS };

    pub fn from_url_param(s: &str) -> Option<Timeframe> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            _ => None,
        }
    }

    /// Longest period that can be requested in one call without running into
    /// the upstream row limit. 97% of the hard cap so boundary candles are
    /// never silently cut off.
    pub fn max_req_period(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.millis * MAX_REQ_CANDLES)
    }

    /// Duration by which a fetch is backdated so the last `num_entries`
    /// persisted candles are re-requested and overwritten.
    pub fn overlay(&self, num_entries: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(num_entries * self.millis)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url_param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ohlc_row_validation() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ohlc = Ohlc::new(10.0, 12.0, 9.0, 11.0, 100.0);

        assert!(OhlcRow::new("BTCUSDT", t, 60_000, ohlc).is_ok());
        assert!(matches!(
            OhlcRow::new("", t, 60_000, ohlc),
            Err(ValidationError::EmptySymbol)
        ));
        assert!(matches!(
            OhlcRow::new("BTCUSDT", t, 0, ohlc),
            Err(ValidationError::InvalidInterval(0))
        ));
        assert!(matches!(
            OhlcRow::new("BTCUSDT", t, 60_000, Ohlc::new(10.0, 9.0, 9.5, 9.8, 1.0)),
            Err(ValidationError::PriceBounds)
        ));
        assert!(matches!(
            OhlcRow::new("BTCUSDT", t, 60_000, Ohlc::new(f64::NAN, 12.0, 9.0, 11.0, 1.0)),
            Err(ValidationError::NonFinitePrice)
        ));
    }

    #[test]
    fn timeframe_max_req_period() {
        // 97% of 1000 candles: 15m -> 873_000_000 ms
        assert_eq!(Timeframe::M15.max_req_period().num_milliseconds(), 873_000_000);
        assert_eq!(Timeframe::M1.max_req_period().num_milliseconds(), 58_200_000);
    }

    #[test]
    fn timeframe_overlay() {
        // 20 candles of 15m = 5h
        assert_eq!(Timeframe::M15.overlay(20).num_hours(), 5);
    }

    #[test]
    fn timeframe_parse_roundtrip() {
        for tf in [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::M30, Timeframe::H1] {
            assert_eq!(Timeframe::from_url_param(tf.url_param), Some(tf));
        }
        assert_eq!(Timeframe::from_url_param("3d"), None);
    }

    #[test]
    fn job_status_roundtrip() {
        for s in [JobStatus::Initialized, JobStatus::Running, JobStatus::Done, JobStatus::Inactive] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn execution_record_duration_matches_bounds() {
        let init = Utc::now() - chrono::Duration::milliseconds(1500);
        let rec = ExecutionRecord::new("pooler", "job", init, None);
        assert_eq!(
            rec.execution_time_ms,
            (rec.finished_at - rec.initialized_at).num_milliseconds()
        );
        assert!(rec.execution_time_ms >= 1500);
    }
}
