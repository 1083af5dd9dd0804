//! Ingestion engine: ties the upstream client, the storage port and the
//! scheduler together.
//!
//! Per tick: load the trading assets for a market kind, fan out one worker
//! per symbol under a semaphore cap, and for each configured timeframe either
//! extend the series incrementally (with an overlay so late upstream
//! corrections are absorbed) or fill interior gaps. Per-symbol failures are
//! logged and never fail the tick; only a failed asset listing does.

use crate::config::PipelineConfig;
use crate::log_fields;
use crate::logger::Logger;
use crate::models::{AssetFilter, MarketKind, OhlcFilter, Timeframe};
use crate::scheduler::{CronScheduler, Job};
use crate::scraper::MarketDataSource;
use crate::storage::StoragePort;
use crate::timeutil::{chunk_time_range, millis_to_duration};
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// How many already-persisted candles an incremental fetch re-requests.
const OVERLAY_CANDLES: i64 = 20;
/// Gap chunking: candles per request window and overlay between windows.
const GAP_CHUNK_PERIODS: i64 = 500;
const GAP_CHUNK_OVERLAY: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    /// Extend each series from its latest persisted candle.
    Incremental,
    /// Fill interior holes found by the gap finder.
    Backfill,
}

#[derive(Clone)]
pub struct IngestionService {
    config: PipelineConfig,
    source: String,
    api: Arc<dyn MarketDataSource>,
    storage: Arc<dyn StoragePort>,
    logger: Logger,
    timeframes: Vec<Timeframe>,
}

impl IngestionService {
    pub fn new(
        config: PipelineConfig,
        source: impl Into<String>,
        api: Arc<dyn MarketDataSource>,
        storage: Arc<dyn StoragePort>,
        logger: Logger,
    ) -> Result<Self> {
        let timeframes = config
            .timeframes
            .iter()
            .map(|t| {
                Timeframe::from_url_param(t)
                    .ok_or_else(|| anyhow::anyhow!("unknown timeframe '{t}' in configuration"))
            })
            .collect::<Result<Vec<_>>>()?;
        if timeframes.is_empty() {
            bail!("at least one timeframe must be configured");
        }

        Ok(Self { config, source: source.into(), api, storage, logger, timeframes })
    }

    fn log(&self) -> Logger {
        self.logger.with_event(self.source.clone())
    }

    fn request_sleep(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.request_sleep_ms)
    }

    /// Make sure the asset universe exists, then register one scraper job per
    /// market kind on the scheduler.
    pub async fn add_jobs(&self, sched: &mut CronScheduler) -> Result<()> {
        self.initialize_assets(MarketKind::Spot).await?;
        self.initialize_assets(MarketKind::Futures).await?;

        let jobs = [
            (MarketKind::Spot, self.config.spot_frequency.clone()),
            (MarketKind::Futures, self.config.futures_frequency.clone()),
        ];
        for (kind, freq) in jobs {
            let service = self.clone();
            let job = Job::new(format!("{}-{kind}-ohlc", self.source), freq, move |cancel| {
                let service = service.clone();
                Box::pin(async move {
                    service.run_ohlc_scraper(kind, ScrapeMode::Incremental, cancel).await
                })
            })
            .with_description(format!("pulls {kind} ohlc candles into storage"));

            sched
                .register(job)
                .await
                .with_context(|| format!("failed to register {kind} ohlc job"))?;
        }
        Ok(())
    }

    /// Import the upstream listing once; short-circuits when assets are
    /// already present.
    pub async fn initialize_assets(&self, kind: MarketKind) -> Result<()> {
        let count = self.storage.count_assets(kind, &self.source).await?;
        if count > 0 {
            self.log().info(
                &format!("assets already exist in {}, skipping setup", kind.asset_collection()),
                None,
            );
            return Ok(());
        }

        self.log().info(
            "no assets found, scraping listing",
            Some(log_fields! { "collection" => kind.asset_collection() }),
        );
        let assets = self
            .api
            .list_assets(kind)
            .await
            .with_context(|| format!("failed to fetch {kind} asset listing"))?;
        if assets.is_empty() {
            bail!("upstream returned no {kind} assets");
        }

        let upsert_log = self.storage.upsert_assets(kind, &assets).await?;
        self.log().info(
            "upserted asset listing",
            Some(log_fields! { "log" => upsert_log.to_string() }),
        );
        Ok(())
    }

    /// One tick: list the trading assets and fan out per-symbol workers,
    /// bounded by the configured parallelism.
    pub async fn run_ohlc_scraper(
        &self,
        kind: MarketKind,
        mode: ScrapeMode,
        cancel: CancellationToken,
    ) -> Result<()> {
        let filter = AssetFilter::trading(&self.source);
        let assets = self
            .storage
            .list_assets(kind, &filter)
            .await
            .with_context(|| format!("failed to list {kind} assets"))?;

        self.log().debug(
            "running ohlc scraper",
            Some(log_fields! {
                "num_assets" => assets.len(),
                "kind" => kind.as_str(),
                "mode" => format!("{mode:?}"),
            }),
        );

        let sem = Arc::new(Semaphore::new(self.config.max_parallel_requests));
        let mut handles = Vec::new();

        for asset in assets {
            if cancel.is_cancelled() {
                break;
            }
            let service = self.clone();
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            let symbol = asset.symbol;
            let worker_symbol = symbol.clone();

            let handle = tokio::spawn(async move {
                let symbol = worker_symbol;
                let _permit = sem.acquire().await?;

                for tf in service.timeframes.clone() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(service.request_sleep()).await;

                    let unit = match mode {
                        ScrapeMode::Incremental => {
                            service.scrape_symbol_timeframe(kind, &symbol, tf, &cancel).await
                        }
                        ScrapeMode::Backfill => {
                            service.fill_gaps_for_symbol(kind, &symbol, tf, &cancel).await
                        }
                    };
                    if let Err(err) = unit {
                        service.log().error(
                            &format!("{err:#}"),
                            Some(log_fields! { "symbol" => symbol.as_str(), "timeframe" => tf.url_param }),
                        );
                    }
                }

                Ok::<(), anyhow::Error>(())
            });
            handles.push((symbol, handle));
        }

        for (symbol, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.log().error(
                    &format!("worker for {symbol} failed: {err:#}"),
                    None,
                ),
                Err(err) => self
                    .log()
                    .error(&format!("task panic for {symbol}: {err}"), None),
            }
        }

        Ok(())
    }

    /// Incremental mode for one (symbol, timeframe): fetch one window from
    /// the latest persisted candle backdated by the overlay. A series with no
    /// data at all enters the discovery loop, walking forward from the
    /// lookback horizon until the listing date is found.
    pub async fn scrape_symbol_timeframe(
        &self,
        kind: MarketKind,
        symbol: &str,
        tf: Timeframe,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let now = Utc::now();
        let default_start =
            now - Duration::days(365 * self.config.default_lookback_years as i64);
        let filter = OhlcFilter::series(kind, symbol, tf.millis);

        let latest = self
            .storage
            .latest_start_time(&filter, default_start)
            .await
            .with_context(|| format!("failed to read latest start time for {symbol}"))?;

        if let Some(hours) = self.config.fresh_breakpoint_hours {
            if latest > now - Duration::hours(hours) {
                self.log().info(
                    "latest ohlc is up to date",
                    Some(log_fields! { "symbol" => symbol, "interval" => tf.millis }),
                );
                return Ok(());
            }
        }

        let overlay = tf.overlay(OVERLAY_CANDLES);
        let max_period = tf.max_req_period();

        if latest == default_start {
            // No data for this series yet. We don't know when the symbol was
            // listed, so walk forward window by window until the first
            // non-empty response, persist it and stop; the next tick
            // continues from there.
            let mut current = default_start;
            let stop = now;

            while current < stop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let from = current - overlay;
                let to = from + max_period;
                tokio::time::sleep(self.request_sleep()).await;

                let fields = log_fields! {
                    "symbol" => symbol,
                    "resolution" => tf.millis / 60_000,
                    "from" => from.to_rfc3339(),
                    "to" => to.to_rfc3339(),
                };
                self.log().debug("init request ohlc", Some(fields.clone()));

                let rows = self.api.get_kline(kind, symbol, from, to, tf).await.with_context(
                    || format!("{symbol}:{} [{from} -> {to}] failed to get ohlc rows", tf.url_param),
                )?;

                if rows.is_empty() {
                    self.log().debug("no ohlc data found", Some(fields));
                    current = current + max_period;
                    continue;
                }

                let upsert_log = self
                    .storage
                    .upsert_ohlc(kind, &rows)
                    .await
                    .with_context(|| format!("{symbol}:{} failed to upsert ohlc rows", tf.url_param))?;
                self.log().info(
                    "upserted ohlc",
                    Some(log_fields! {
                        "symbol" => symbol,
                        "resolution" => tf.millis / 60_000,
                        "log" => upsert_log.to_string(),
                    }),
                );
                break;
            }
            return Ok(());
        }

        let from = latest - overlay;
        let to = from + max_period;

        let rows = self.api.get_kline(kind, symbol, from, to, tf).await.with_context(|| {
            format!("{symbol}:{} [{from} -> {to}] failed to get ohlc rows", tf.url_param)
        })?;
        if rows.is_empty() {
            self.log().debug(
                "no new ohlc rows",
                Some(log_fields! { "symbol" => symbol, "interval" => tf.millis }),
            );
            return Ok(());
        }

        let upsert_log = self
            .storage
            .upsert_ohlc(kind, &rows)
            .await
            .with_context(|| format!("{symbol}:{} failed to upsert ohlc rows", tf.url_param))?;
        self.log().info(
            "upserted ohlc",
            Some(log_fields! {
                "symbol" => symbol,
                "resolution" => tf.millis / 60_000,
                "log" => upsert_log.to_string(),
                "coll" => kind.ohlc_collection(),
            }),
        );
        Ok(())
    }

    /// Backfill mode for one (symbol, timeframe): close every interior hole
    /// the gap finder reports, requesting chunk by chunk because a gap can
    /// exceed the upstream row limit.
    pub async fn fill_gaps_for_symbol(
        &self,
        kind: MarketKind,
        symbol: &str,
        tf: Timeframe,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let filter = OhlcFilter::series(kind, symbol, tf.millis);
        let gaps = self
            .storage
            .find_gaps(&filter)
            .await
            .with_context(|| format!("failed to find gaps for {symbol}"))?;

        if gaps.is_empty() {
            self.log().debug(
                "no gaps found for ohlc",
                Some(log_fields! { "symbol" => symbol, "interval" => tf.millis }),
            );
            return Ok(());
        }

        for (interval, group) in gaps {
            self.log().debug(
                "found gaps",
                Some(log_fields! { "symbol" => symbol, "interval" => interval, "num_gaps" => group.len() }),
            );

            for gap in group {
                self.log().debug(
                    "filling gap",
                    Some(log_fields! { "symbol" => symbol, "gap" => gap.to_string() }),
                );

                let chunks = chunk_time_range(
                    gap.start_of_gap,
                    gap.end_of_gap,
                    millis_to_duration(interval),
                    GAP_CHUNK_PERIODS,
                    GAP_CHUNK_OVERLAY,
                )?;

                for (idx, chunk) in chunks.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    tokio::time::sleep(self.request_sleep()).await;

                    self.log().debug(
                        "requesting chunk",
                        Some(log_fields! {
                            "chunk_idx" => idx,
                            "num_chunks" => chunks.len(),
                            "symbol" => symbol,
                            "from" => chunk.from.to_rfc3339(),
                            "to" => chunk.to.to_rfc3339(),
                            "interval" => interval,
                        }),
                    );

                    let rows = self
                        .api
                        .get_kline(kind, symbol, chunk.from, chunk.to, tf)
                        .await
                        .with_context(|| {
                            format!(
                                "{symbol}:{} [{} -> {}] failed to get ohlc rows",
                                tf.url_param, chunk.from, chunk.to
                            )
                        })?;
                    if rows.is_empty() {
                        continue;
                    }

                    let upsert_log = self.storage.upsert_ohlc(kind, &rows).await?;
                    self.log().info(
                        "upserted ohlc",
                        Some(log_fields! { "symbol" => symbol, "log" => upsert_log.to_string() }),
                    );
                }
            }
        }

        Ok(())
    }
}
