pub mod http_client;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::models::{Asset, MarketKind, OhlcRow, Timeframe, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use self::http_client::HttpClient;
use self::parsers::{parse_exchange_info, parse_kline_rows};

pub const SOURCE_BINANCE: &str = "binance";

/// Number of candles the upstream serves per kline request at most.
const KLINE_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("request to {url} failed: {message}")]
    Fetch { url: String, message: String },
    #[error("unexpected http status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("symbol is required")]
    EmptySymbol,
    #[error(transparent)]
    InvalidRow(#[from] ValidationError),
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable upstream market-data source. Implementations guarantee that
/// returned kline rows are ordered by start_time ascending and carry the
/// requested timeframe's interval.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// The current instrument universe for a market kind.
    async fn list_assets(&self, kind: MarketKind) -> Result<Vec<Asset>, UpstreamError>;

    /// Candles for one symbol strictly within `[from, to]`. May be empty.
    async fn get_kline(
        &self,
        kind: MarketKind,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<Vec<OhlcRow>, UpstreamError>;
}

// ── Binance client ────────────────────────────────────────────────────────────

pub struct BinanceApi {
    client: HttpClient,
    spot_base_url: String,
    futures_base_url: String,
}

impl BinanceApi {
    pub fn new(config: &ScraperConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: HttpClient::new(config)?,
            spot_base_url: config.spot_base_url.trim_end_matches('/').to_string(),
            futures_base_url: config.futures_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Spot and futures serve the same payload shapes; only the host and
    /// path prefix differ.
    fn kline_url(
        &self,
        kind: MarketKind,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> String {
        let base = match kind {
            MarketKind::Spot => format!("{}/api/v3/klines", self.spot_base_url),
            MarketKind::Futures => format!("{}/fapi/v1/klines", self.futures_base_url),
        };
        format!(
            "{base}?symbol={symbol}&interval={}&startTime={}&endTime={}&limit={KLINE_LIMIT}",
            timeframe.url_param,
            from.timestamp_millis(),
            to.timestamp_millis(),
        )
    }

    fn exchange_info_url(&self, kind: MarketKind) -> String {
        match kind {
            MarketKind::Spot => format!("{}/api/v3/exchangeInfo", self.spot_base_url),
            MarketKind::Futures => format!("{}/fapi/v1/exchangeInfo", self.futures_base_url),
        }
    }
}

#[async_trait]
impl MarketDataSource for BinanceApi {
    async fn list_assets(&self, kind: MarketKind) -> Result<Vec<Asset>, UpstreamError> {
        let url = self.exchange_info_url(kind);
        let body = self.client.get_text(&url).await?;
        let assets = parse_exchange_info(SOURCE_BINANCE, &body)?;
        debug!("{} exchange info: {} symbols", kind, assets.len());
        Ok(assets)
    }

    async fn get_kline(
        &self,
        kind: MarketKind,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<Vec<OhlcRow>, UpstreamError> {
        if symbol.is_empty() {
            return Err(UpstreamError::EmptySymbol);
        }
        let symbol = symbol.to_uppercase();

        let url = self.kline_url(kind, &symbol, from, to, timeframe);
        let body = self.client.get_text(&url).await?;
        parse_kline_rows(&symbol, timeframe, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn api() -> BinanceApi {
        BinanceApi::new(&ScraperConfig::default()).unwrap()
    }

    #[test]
    fn kline_urls_carry_window_and_limit() {
        let from = Utc.with_ymd_and_hms(2021, 10, 10, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2021, 10, 10, 1, 0, 0).unwrap();

        let spot = api().kline_url(MarketKind::Spot, "BTCUSDT", from, to, Timeframe::M1);
        assert_eq!(
            spot,
            format!(
                "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=1m&startTime={}&endTime={}&limit=1000",
                from.timestamp_millis(),
                to.timestamp_millis()
            )
        );

        let futures = api().kline_url(MarketKind::Futures, "BTCUSDT", from, to, Timeframe::M15);
        assert!(futures.starts_with("https://fapi.binance.com/fapi/v1/klines?symbol=BTCUSDT&interval=15m"));
    }

    #[test]
    fn exchange_info_urls_per_kind() {
        assert_eq!(
            api().exchange_info_url(MarketKind::Spot),
            "https://api.binance.com/api/v3/exchangeInfo"
        );
        assert_eq!(
            api().exchange_info_url(MarketKind::Futures),
            "https://fapi.binance.com/fapi/v1/exchangeInfo"
        );
    }

    #[tokio::test]
    async fn empty_symbol_is_rejected_before_any_request() {
        let from = Utc::now() - chrono::Duration::hours(1);
        let result = api()
            .get_kline(MarketKind::Spot, "", from, Utc::now(), Timeframe::M1)
            .await;
        assert!(matches!(result, Err(UpstreamError::EmptySymbol)));
    }
}
