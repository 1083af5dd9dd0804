//! Level-tagged structured logging with two interchangeable sinks: a plain
//! console renderer and a store-backed variant that also persists every
//! record through the storage port and can be queried back.

use crate::storage::{StorageError, StoragePort};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

pub type LogFields = serde_json::Map<String, serde_json::Value>;

/// Build a [`LogFields`] map from `key => value` pairs.
#[macro_export]
macro_rules! log_fields {
    ($($k:literal => $v:expr),* $(,)?) => {{
        let mut map = $crate::logger::LogFields::new();
        $(map.insert($k.to_string(), ::serde_json::json!($v));)*
        map
    }};
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("method cannot be used with a console logger")]
    UnsupportedOnConsole,
    #[error("invalid time range: 'from' date cannot be after 'to' date")]
    InvalidTimeRange,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ── Levels ────────────────────────────────────────────────────────────────────

/// Log severity, persisted as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn code(&self) -> i16 {
        match self {
            LogLevel::Trace => 0,
            LogLevel::Debug => 1,
            LogLevel::Info => 2,
            LogLevel::Warn => 3,
            LogLevel::Error => 4,
            LogLevel::Fatal => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl From<LogLevel> for i16 {
    fn from(level: LogLevel) -> i16 {
        level.code()
    }
}

impl TryFrom<i16> for LogLevel {
    type Error = String;

    fn try_from(code: i16) -> Result<Self, String> {
        match code {
            0 => Ok(LogLevel::Trace),
            1 => Ok(LogLevel::Debug),
            2 => Ok(LogLevel::Info),
            3 => Ok(LogLevel::Warn),
            4 => Ok(LogLevel::Error),
            5 => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level code {other}")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// One log record. Source, event and event_id are optional context tags;
/// fields is an optional free-form map. Records are immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// When the log was created (UTC).
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Not rendered to the console.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<LogFields>,
}

impl Log {
    fn render(&self, settings: &LoggerSettings) -> String {
        let time = match settings.offset {
            Some(offset) => self
                .time
                .with_timezone(&offset)
                .format(&settings.time_format)
                .to_string(),
            None => self.time.format(&settings.time_format).to_string(),
        };

        let mut out = String::new();
        let _ = write!(
            out,
            "{}  {:<6}  {:<12}{:<12}  {}",
            time,
            self.level.as_str(),
            self.source.as_deref().unwrap_or(""),
            self.event.as_deref().unwrap_or(""),
            self.message
        );

        if let Some(fields) = &self.fields {
            for (k, v) in fields {
                match v {
                    serde_json::Value::String(s) => {
                        let _ = write!(out, " {k}={s}");
                    }
                    other => {
                        let _ = write!(out, " {k}={other}");
                    }
                }
            }
        }

        out
    }
}

/// Console rendering settings. The zone only affects how the timestamp is
/// printed; stored records stay UTC.
#[derive(Debug, Clone)]
pub struct LoggerSettings {
    pub offset: Option<FixedOffset>,
    pub time_format: String,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self { offset: None, time_format: "%Y-%m-%d %H:%M:%S".to_string() }
    }
}

// ── Query filter ──────────────────────────────────────────────────────────────

/// Options for querying persisted logs. Results are ordered by time
/// descending.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub event: Option<String>,
    pub event_id: Option<String>,
    pub level: Option<LogLevel>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl LogFilter {
    pub const DEFAULT_LIMIT: usize = 100;
}

// ── Logger handle ─────────────────────────────────────────────────────────────

#[derive(Clone)]
enum LogSink {
    Console,
    Store(Arc<dyn StoragePort>),
}

/// Cheap-to-clone logging handle. `with_source` / `with_event` /
/// `with_event_id` derive a new handle carrying the tag; the sink is shared.
#[derive(Clone)]
pub struct Logger {
    sink: LogSink,
    settings: Arc<LoggerSettings>,
    source: Option<String>,
    event: Option<String>,
    event_id: Option<String>,
}

impl Logger {
    pub fn console(settings: LoggerSettings) -> Self {
        Self {
            sink: LogSink::Console,
            settings: Arc::new(settings),
            source: None,
            event: None,
            event_id: None,
        }
    }

    /// A logger that appends every record through the storage port and echoes
    /// it to stdout.
    pub fn store(storage: Arc<dyn StoragePort>, settings: LoggerSettings) -> Self {
        Self {
            sink: LogSink::Store(storage),
            settings: Arc::new(settings),
            source: None,
            event: None,
            event_id: None,
        }
    }

    pub fn with_source(&self, v: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.source = Some(v.into());
        next
    }

    pub fn with_event(&self, v: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.event = Some(v.into());
        next
    }

    pub fn with_event_id(&self, v: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.event_id = Some(v.into());
        next
    }

    fn new_log(&self, level: LogLevel, message: &str, fields: Option<LogFields>) -> Log {
        Log {
            time: Utc::now(),
            level,
            message: message.to_string(),
            source: self.source.clone(),
            event: self.event.clone(),
            event_id: self.event_id.clone(),
            fields,
        }
    }

    /// Build, render and persist one record. The console sink only prints;
    /// the store sink also appends through the storage port.
    pub async fn append(
        &self,
        level: LogLevel,
        message: &str,
        fields: Option<LogFields>,
    ) -> Result<(), LoggerError> {
        let log = self.new_log(level, message, fields);
        println!("{}", log.render(&self.settings));

        if let LogSink::Store(storage) = &self.sink {
            storage.append_log(&log).await?;
        }
        Ok(())
    }

    /// Fire-and-forget variant of [`Logger::append`]. Persisting happens on a
    /// background task when a runtime is available; failures are reported via
    /// tracing rather than bubbled up.
    fn log(&self, level: LogLevel, message: &str, fields: Option<LogFields>) {
        let log = self.new_log(level, message, fields);
        println!("{}", log.render(&self.settings));

        if let LogSink::Store(storage) = &self.sink {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let storage = Arc::clone(storage);
                handle.spawn(async move {
                    if let Err(err) = storage.append_log(&log).await {
                        tracing::warn!("failed to persist log record: {err}");
                    }
                });
            }
        }
    }

    pub fn trace(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Trace, message, fields);
    }

    pub fn debug(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Error, message, fields);
    }

    /// Logs at the highest severity and continues; terminating the process is
    /// the caller's decision.
    pub fn fatal(&self, message: &str, fields: Option<LogFields>) {
        self.log(LogLevel::Fatal, message, fields);
    }

    /// Query persisted records, newest first. Console loggers have nothing to
    /// query and refuse.
    pub async fn find_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LoggerError> {
        let LogSink::Store(storage) = &self.sink else {
            return Err(LoggerError::UnsupportedOnConsole);
        };
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LoggerError::InvalidTimeRange);
            }
        }
        Ok(storage.find_logs(filter).await?)
    }

    pub async fn log_exists(&self, filter: &LogFilter) -> Result<bool, LoggerError> {
        let LogSink::Store(storage) = &self.sink else {
            return Err(LoggerError::UnsupportedOnConsole);
        };
        Ok(storage.log_exists(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_log() -> Log {
        Log {
            time: Utc.with_ymd_and_hms(2024, 5, 2, 13, 45, 7).unwrap(),
            level: LogLevel::Info,
            message: "upserted rows".to_string(),
            source: Some("pooler".to_string()),
            event: Some("binance".to_string()),
            event_id: None,
            fields: None,
        }
    }

    #[test]
    fn render_uses_fixed_columns() {
        let log = sample_log();
        let out = log.render(&LoggerSettings::default());
        assert_eq!(
            out,
            "2024-05-02 13:45:07  info    pooler      binance       upserted rows"
        );
    }

    #[test]
    fn render_appends_fields_as_kv_pairs() {
        let mut log = sample_log();
        log.fields = Some(log_fields! { "symbol" => "BTCUSDT" });
        let out = log.render(&LoggerSettings::default());
        assert!(out.ends_with("upserted rows symbol=BTCUSDT"), "got: {out}");
    }

    #[test]
    fn render_respects_zone_offset() {
        let log = sample_log();
        let settings = LoggerSettings {
            offset: Some(FixedOffset::east_opt(2 * 3600).unwrap()),
            ..Default::default()
        };
        assert!(log.render(&settings).starts_with("2024-05-02 15:45:07"));
    }

    #[test]
    fn level_codes_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::try_from(4i16), Ok(LogLevel::Error));
        assert!(LogLevel::try_from(9i16).is_err());
    }

    #[tokio::test]
    async fn console_logger_refuses_queries() {
        let logger = Logger::console(LoggerSettings::default());
        assert!(matches!(
            logger.find_logs(&LogFilter::default()).await,
            Err(LoggerError::UnsupportedOnConsole)
        ));
        assert!(matches!(
            logger.log_exists(&LogFilter::default()).await,
            Err(LoggerError::UnsupportedOnConsole)
        ));
    }

    #[tokio::test]
    async fn store_logger_appends_and_queries() {
        use crate::storage::{MemStorage, StoragePort};

        let storage: Arc<dyn StoragePort> = Arc::new(MemStorage::new());
        let logger = Logger::store(Arc::clone(&storage), LoggerSettings::default())
            .with_source("api")
            .with_event_id("abc");

        for i in 0..10 {
            logger.append(LogLevel::Info, &format!("message {i}"), None).await.unwrap();
        }

        let logs = logger
            .find_logs(&LogFilter {
                event_id: Some("abc".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs.iter().all(|l| l.event_id.as_deref() == Some("abc")));
        assert!(logs.windows(2).all(|w| w[0].time >= w[1].time));

        assert!(logger
            .log_exists(&LogFilter { source: Some("api".into()), ..Default::default() })
            .await
            .unwrap());

        // An inverted range is refused before touching storage.
        assert!(matches!(
            logger
                .find_logs(&LogFilter {
                    from: Some(Utc::now()),
                    to: Some(Utc::now() - chrono::Duration::hours(1)),
                    ..Default::default()
                })
                .await,
            Err(LoggerError::InvalidTimeRange)
        ));
    }

    #[test]
    fn builder_tags_compose() {
        let logger = Logger::console(LoggerSettings::default())
            .with_source("api")
            .with_event("auth")
            .with_event_id("abc");
        let log = logger.new_log(LogLevel::Debug, "x", None);
        assert_eq!(log.source.as_deref(), Some("api"));
        assert_eq!(log.event.as_deref(), Some("auth"));
        assert_eq!(log.event_id.as_deref(), Some("abc"));
    }
}
