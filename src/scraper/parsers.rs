//! Decoding of upstream payloads: kline arrays and exchange-info listings.

use super::UpstreamError;
use crate::models::{Asset, Ohlc, OhlcRow, Timeframe};
use crate::timeutil::unix_millis_to_datetime;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

// ── Klines ────────────────────────────────────────────────────────────────────

/// One kline is an array of mixed-type values:
///
/// ```text
/// [ open_time_ms, "open", "high", "low", "close", "volume",
///   close_time_ms, "base_asset_volume", trade_count, ... ]
/// ```
///
/// The interval of each produced row is taken from the requested timeframe,
/// never derived from the payload, so rows always agree with what the caller
/// asked for.
pub fn parse_kline_rows(
    symbol: &str,
    timeframe: Timeframe,
    payload: &str,
) -> Result<Vec<OhlcRow>, UpstreamError> {
    let data: Vec<Vec<Value>> =
        serde_json::from_str(payload).map_err(|e| UpstreamError::Decode(e.to_string()))?;

    let mut rows = Vec::with_capacity(data.len());
    for entry in &data {
        rows.push(parse_kline_entry(symbol, timeframe, entry)?);
    }

    // The port guarantees rows ordered by start_time even if the upstream
    // response is not.
    rows.sort_by_key(|r| r.start_time);
    Ok(rows)
}

fn parse_kline_entry(
    symbol: &str,
    timeframe: Timeframe,
    entry: &[Value],
) -> Result<OhlcRow, UpstreamError> {
    if entry.len() < 9 {
        return Err(UpstreamError::Decode(format!(
            "kline row has {} fields, expected at least 9",
            entry.len()
        )));
    }

    let start_ms = value_to_i64(&entry[0])
        .ok_or_else(|| UpstreamError::Decode("invalid kline open time".into()))?;
    let ohlc = Ohlc::new(
        value_to_f64(&entry[1])?,
        value_to_f64(&entry[2])?,
        value_to_f64(&entry[3])?,
        value_to_f64(&entry[4])?,
        value_to_f64(&entry[5])?,
    );

    let row = OhlcRow::new(symbol, unix_millis_to_datetime(start_ms), timeframe.millis, ohlc)?;

    let base_asset_volume = entry.get(7).and_then(|v| value_to_f64(v).ok());
    let trade_count = entry.get(8).and_then(value_to_i64);

    let row = match base_asset_volume {
        Some(v) => row.with_base_asset_volume(v),
        None => row,
    };
    Ok(match trade_count {
        Some(n) => row.with_trade_count(n),
        None => row,
    })
}

/// The api reports prices as decimal strings and counts as numbers; accept
/// both.
fn value_to_f64(value: &Value) -> Result<f64, UpstreamError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| UpstreamError::Decode(format!("invalid number {n}"))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| UpstreamError::Decode(format!("invalid decimal string '{s}'"))),
        other => Err(UpstreamError::Decode(format!("unexpected value {other}"))),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ── Exchange info ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbol {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default)]
    onboard_date: Option<i64>,
}

/// Decode an exchange-info response into asset records tagged with the
/// source.
pub fn parse_exchange_info(source: &str, payload: &str) -> Result<Vec<Asset>, UpstreamError> {
    let info: ExchangeInfo =
        serde_json::from_str(payload).map_err(|e| UpstreamError::Decode(e.to_string()))?;

    let now = Utc::now();
    Ok(info
        .symbols
        .into_iter()
        .map(|s| Asset {
            source: source.to_string(),
            symbol: s.symbol,
            status: s.status,
            base_asset: s.base_asset,
            quote_asset: s.quote_asset,
            updated_at: now,
            contract_type: s.contract_type,
            onboard_date: s.onboard_date.map(unix_millis_to_datetime),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLINES: &str = r#"[
        [1591258380000, "9641.0", "9643.5", "9640.1", "9642.8", "210", 1591258439999, "2.2", 51, "120", "1.25", "0"],
        [1591258320000, "9640.7", "9642.4", "9640.6", "9642.0", "206", 1591258379999, "2.13660389", 48, "119", "1.23424865", "0"]
    ]"#;

    #[test]
    fn parses_and_sorts_kline_rows() {
        let rows = parse_kline_rows("BTCUSDT", Timeframe::M1, KLINES).unwrap();
        assert_eq!(rows.len(), 2);

        // Response order was newest-first; parsed rows are ascending.
        assert!(rows[0].start_time < rows[1].start_time);

        let first = &rows[0];
        assert_eq!(first.symbol, "BTCUSDT");
        assert_eq!(first.interval, Timeframe::M1.millis);
        assert_eq!(first.start_time, unix_millis_to_datetime(1_591_258_320_000));
        assert_eq!(first.ohlc.open, 9640.7);
        assert_eq!(first.ohlc.high, 9642.4);
        assert_eq!(first.ohlc.low, 9640.6);
        assert_eq!(first.ohlc.close, 9642.0);
        assert_eq!(first.ohlc.volume, 206.0);
        assert_eq!(first.base_asset_volume, Some(2.13660389));
        assert_eq!(first.trade_count, Some(48));
    }

    #[test]
    fn empty_response_yields_no_rows() {
        assert!(parse_kline_rows("BTCUSDT", Timeframe::M1, "[]").unwrap().is_empty());
    }

    #[test]
    fn truncated_kline_row_is_a_decode_error() {
        let payload = r#"[[1591258320000, "1.0", "2.0"]]"#;
        assert!(matches!(
            parse_kline_rows("BTCUSDT", Timeframe::M1, payload),
            Err(UpstreamError::Decode(_))
        ));
    }

    #[test]
    fn non_numeric_price_is_a_decode_error() {
        let payload = r#"[[1591258320000, "abc", "2.0", "0.5", "1.5", "10", 0, "1", 2]]"#;
        assert!(matches!(
            parse_kline_rows("BTCUSDT", Timeframe::M1, payload),
            Err(UpstreamError::Decode(_))
        ));
    }

    #[test]
    fn parses_exchange_info_listing() {
        let payload = r#"{
            "timezone": "UTC",
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT"},
                {"symbol": "DOGEUSDT", "status": "BREAK", "baseAsset": "DOGE", "quoteAsset": "USDT",
                 "contractType": "PERPETUAL", "onboardDate": 1569398400000}
            ]
        }"#;
        let assets = parse_exchange_info("binance", payload).unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].symbol, "BTCUSDT");
        assert_eq!(assets[0].source, "binance");
        assert_eq!(assets[0].status, "TRADING");
        assert!(assets[0].contract_type.is_none());
        assert_eq!(assets[1].contract_type.as_deref(), Some("PERPETUAL"));
        assert_eq!(
            assets[1].onboard_date,
            Some(unix_millis_to_datetime(1_569_398_400_000))
        );
    }
}
