use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Set from the environment, not the config file.
    #[serde(skip)]
    pub is_production: bool,
}

/// Bind address of the operational HTTP surface
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Upstream HTTP client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_spot_base_url")]
    pub spot_base_url: String,

    #[serde(default = "default_futures_base_url")]
    pub futures_base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Upper bound on concurrent upstream requests.
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,

    /// Pause before each upstream call inside a worker, to respect rate
    /// limits.
    #[serde(default = "default_request_sleep_ms")]
    pub request_sleep_ms: u64,

    /// How far back the first scrape of a fresh symbol reaches.
    #[serde(default = "default_lookback_years")]
    pub default_lookback_years: i32,

    /// When set, symbols whose latest candle is younger than this many hours
    /// are skipped entirely on incremental ticks.
    #[serde(default)]
    pub fresh_breakpoint_hours: Option<i64>,

    #[serde(default = "default_spot_frequency")]
    pub spot_frequency: String,

    #[serde(default = "default_futures_frequency")]
    pub futures_frequency: String,

    /// Candle resolutions to ingest, as upstream url tokens.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/candles.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_spot_base_url() -> String {
    "https://api.binance.com".to_string()
}
fn default_futures_base_url() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_user_agent() -> String {
    "candle-etl/0.1 (market data ingestion worker)".to_string()
}
fn default_max_parallel_requests() -> usize {
    3
}
fn default_request_sleep_ms() -> u64 {
    200
}
fn default_lookback_years() -> i32 {
    6
}
fn default_spot_frequency() -> String {
    "@every 30s".to_string()
}
fn default_futures_frequency() -> String {
    "@every 30s".to_string()
}
fn default_timeframes() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string(), "15m".to_string()]
}

// ── Loader ───────────────────────────────────────────────────────────────────

/// Overrides the default config file path.
pub const ENV_CONF_PATH: &str = "CANDLE_CONF_PATH";
/// Flags production mode.
pub const ENV_IS_PRODUCTION: &str = "CANDLE_IS_PRODUCTION";
/// Redirects storage to an isolated namespace.
pub const ENV_USE_TEST_DB: &str = "CANDLE_USE_TEST_DB";

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let conf_path =
            std::env::var(ENV_CONF_PATH).unwrap_or_else(|_| "config/default".to_string());

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name(&conf_path)
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("CANDLE").separator("__"))
            .build()
            .context("failed to assemble configuration")?;

        let mut app_cfg: AppConfig =
            cfg.try_deserialize().context("failed to deserialize configuration")?;

        app_cfg.is_production = env_flag(ENV_IS_PRODUCTION);
        if env_flag(ENV_USE_TEST_DB) {
            app_cfg.storage.db_path = test_db_path(&app_cfg.storage.db_path);
        }

        Ok(app_cfg)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// `data/candles.duckdb` -> `data/candles_test.duckdb`
fn test_db_path(path: &PathBuf) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("candles");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("duckdb");
    path.with_file_name(format!("{stem}_test.{ext}"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            scraper: ScraperConfig::default(),
            pipeline: PipelineConfig::default(),
            is_production: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: default_api_host(), port: default_api_port() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path(), run_migrations: true }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            spot_base_url: default_spot_base_url(),
            futures_base_url: default_futures_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            jitter_ms: default_jitter_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: default_max_parallel_requests(),
            request_sleep_ms: default_request_sleep_ms(),
            default_lookback_years: default_lookback_years(),
            fresh_breakpoint_hours: None,
            spot_frequency: default_spot_frequency(),
            futures_frequency: default_futures_frequency(),
            timeframes: default_timeframes(),
        }
    }
}
