mod api;
mod config;
mod logger;
mod models;
mod pipeline;
mod scheduler;
mod scraper;
mod storage;
mod timeutil;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::logger::{Logger, LoggerSettings};
use crate::models::MarketKind;
use crate::pipeline::{IngestionService, ScrapeMode};
use crate::scheduler::CronScheduler;
use crate::scraper::{BinanceApi, MarketDataSource, SOURCE_BINANCE};
use crate::storage::{DuckStorage, StoragePort};

/// Source tag this process writes into the job ledger and the log stream.
const APP_SOURCE: &str = "candle-etl";

#[derive(Parser)]
#[command(name = "candle-etl", about = "Periodic OHLC ingestion worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler with the ingestion jobs and the operational API
    Run,

    /// One-shot incremental scrape over all trading assets
    Scrape,

    /// One-shot gap backfill over all trading assets
    Backfill,

    /// Show database statistics
    Stats,

    /// Apply schema migrations and indexes without ingesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "candle_etl=info,warn",
        1 => "candle_etl=debug,info",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Scrape => one_shot(config, ScrapeMode::Incremental).await,
        Command::Backfill => one_shot(config, ScrapeMode::Backfill).await,
        Command::Stats => stats(config).await,
        Command::Migrate => {
            let storage = open_storage(&config)?;
            storage.ensure_indexes().await?;
            println!("Migrations applied.");
            Ok(())
        }
    }
}

fn open_storage(config: &AppConfig) -> Result<Arc<DuckStorage>> {
    let storage = DuckStorage::open(&config.storage.db_path)
        .with_context(|| format!("failed to open storage at {:?}", config.storage.db_path))?;
    Ok(Arc::new(storage))
}

fn build_service(
    config: &AppConfig,
    storage: Arc<dyn StoragePort>,
    logger: &Logger,
) -> Result<IngestionService> {
    let api = BinanceApi::new(&config.scraper)?;
    let api: Arc<dyn MarketDataSource> = Arc::new(api);
    IngestionService::new(config.pipeline.clone(), SOURCE_BINANCE, api, storage, logger.clone())
}

async fn run(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config)?;
    let storage_port: Arc<dyn StoragePort> = storage;
    storage_port
        .ensure_indexes()
        .await
        .context("failed to create storage indexes")?;

    let logger =
        Logger::store(Arc::clone(&storage_port), LoggerSettings::default()).with_source(APP_SOURCE);

    let service = build_service(&config, Arc::clone(&storage_port), &logger)?;

    let mut sched = CronScheduler::new(APP_SOURCE, Arc::clone(&storage_port), logger.clone());
    service
        .add_jobs(&mut sched)
        .await
        .context("failed to register ingestion jobs")?;

    let cancel = CancellationToken::new();
    sched.start(cancel.clone());
    info!("scheduler started with jobs: {:?}", sched.job_names());

    let api_state = api::ApiState { storage: Arc::clone(&storage_port), logger: logger.clone() };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move { api::serve(api_state, &api_config, api_cancel).await });

    tokio::signal::ctrl_c().await.context("failed to install ctrl-c handler")?;
    info!("shutdown signal received, stopping");
    cancel.cancel();

    storage_port.set_jobs_inactive(APP_SOURCE).await?;
    logger.info("jobs set to inactive, exiting", None);
    let _ = api_task.await;
    Ok(())
}

async fn one_shot(config: AppConfig, mode: ScrapeMode) -> Result<()> {
    let label = match mode {
        ScrapeMode::Incremental => "incremental scrape",
        ScrapeMode::Backfill => "gap backfill",
    };
    let _t = timeutil::Timer::start(label);

    let storage = open_storage(&config)?;
    let storage_port: Arc<dyn StoragePort> = storage;
    storage_port.ensure_indexes().await?;

    let logger =
        Logger::store(Arc::clone(&storage_port), LoggerSettings::default()).with_source(APP_SOURCE);
    let service = build_service(&config, Arc::clone(&storage_port), &logger)?;

    service.initialize_assets(MarketKind::Spot).await?;
    service.initialize_assets(MarketKind::Futures).await?;

    let cancel = CancellationToken::new();
    for kind in [MarketKind::Spot, MarketKind::Futures] {
        service.run_ohlc_scraper(kind, mode, cancel.clone()).await?;
    }
    Ok(())
}

async fn stats(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config)?;
    let storage_port: Arc<dyn StoragePort> = storage;

    println!("─────────────────────────────────");
    println!("  candle-etl — database stats");
    for kind in [MarketKind::Spot, MarketKind::Futures] {
        let assets = storage_port.count_assets(kind, SOURCE_BINANCE).await?;
        let summary = storage_port.ohlc_summary(kind).await?;
        println!("─────────────────────────────────");
        println!("  {} market", kind);
        println!("  Assets : {}", timeutil::fmt_number(assets as i64));
        println!("  Candles: {}", timeutil::fmt_number(summary.row_count as i64));
        println!(
            "  From   : {}",
            summary.first_start_time.map(|t| t.to_string()).unwrap_or_else(|| "—".into())
        );
        println!(
            "  To     : {}",
            summary.last_start_time.map(|t| t.to_string()).unwrap_or_else(|| "—".into())
        );
    }
    println!("─────────────────────────────────");
    Ok(())
}
