//! Trading loop command
//!
//! Wires the Binance client for the configured market, the SQLite trade store
//! and the orchestrator
//! together, then polls until Ctrl+C. Open positions are not closed on
//! shutdown; they are restored from the store on the next start.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use regime_trader::exchange::{BinanceClient, BinanceFuturesClient, BinanceMarket, ExchangeClient};
use regime_trader::storage::SqliteTradeStore;
use regime_trader::{Config, Orchestrator};

pub fn run(
    config_path: String,
    dry_run: bool,
    live: bool,
    interval: Option<u64>,
    db: Option<String>,
) -> Result<()> {
    if dry_run && live {
        anyhow::bail!("Cannot specify both --dry-run and --live");
    }

    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, dry_run, live, interval, db))
}

fn load_config(config_path: &str) -> Result<Config> {
    if Path::new(config_path).exists() {
        let config = Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?;
        info!("Loaded configuration from: {}", config_path);
        Ok(config)
    } else {
        warn!("Config file {} not found, using defaults", config_path);
        Ok(Config::from_env())
    }
}

fn build_exchange(config: &Config) -> regime_trader::TradingResult<Arc<dyn ExchangeClient>> {
    let exchange = &config.exchange;
    let base_url = exchange.base_url().to_string();
    let client: Arc<dyn ExchangeClient> = match exchange.market {
        BinanceMarket::Futures => Arc::new(BinanceFuturesClient::with_base_url(
            base_url,
            exchange.credentials(),
            exchange.retry.clone(),
        )?),
        BinanceMarket::Spot => Arc::new(BinanceClient::with_base_url(
            base_url,
            exchange.credentials(),
            exchange.retry.clone(),
        )?),
    };
    Ok(client)
}

async fn run_async(
    config_path: String,
    dry_run: bool,
    live: bool,
    interval: Option<u64>,
    db: Option<String>,
) -> Result<()> {
    let mut config = load_config(&config_path)?;

    if dry_run {
        config.trading.dry_run = true;
    }
    if live {
        config.trading.dry_run = false;
    }
    if let Some(secs) = interval {
        config.trading.loop_interval_seconds = secs;
    }
    if let Some(path) = db {
        config.storage.db_path = path;
    }

    config.validate().context("Invalid configuration")?;

    let mode = if config.trading.dry_run { "DRY RUN" } else { "LIVE" };
    info!("{}", "=".repeat(60));
    info!("REGIME TRADER - {} MODE", mode);
    info!("{}", "=".repeat(60));
    info!("Symbol:          {} ({})", config.trading.symbol, config.exchange.market);
    info!(
        "Regime:          ADX({}) on {}, trend > {}, range < {}, cooldown {}m",
        config.regime.adx_period,
        config.regime.timeframe,
        config.regime.trend_start,
        config.regime.range_return,
        config.regime.cooldown_minutes
    );
    info!("Mean reversion:  {}", config.mean_reversion.timeframe);
    info!("Trend sniper:    {}", config.trend_sniper.timeframe);
    info!("Position size:   {}% of balance", config.trading.position_size_percent);
    info!("Cycle interval:  {}s", config.trading.loop_interval_seconds);
    info!("Trade database:  {}", config.storage.db_path);

    if !config.trading.dry_run {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let exchange = build_exchange(&config).context("Failed to create exchange client")?;
    let store = SqliteTradeStore::open(&config.storage.db_path).context("Failed to open trade database")?;

    let mut orchestrator = Orchestrator::new(&config, exchange, Arc::new(store))
        .context("Failed to create orchestrator")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                signal_token.cancel();
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    orchestrator.run(shutdown).await?;
    info!("Trading session ended.");
    Ok(())
}
