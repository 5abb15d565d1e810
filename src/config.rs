//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials and the dry-run switch. Every section
//! has defaults, so a partial file (or no file) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::backoff::RetryPolicy;
use crate::error::{TradingError, TradingResult};
use crate::exchange::binance::{BinanceMarket, Credentials};
use crate::market::parse_timeframe;
use crate::regime::RegimeConfig;
use crate::strategies::{MeanReversionConfig, TrendSniperConfig};
use crate::types::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub regime: RegimeConfig,
    pub mean_reversion: MeanReversionConfig,
    pub trend_sniper: TrendSniperConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from JSON file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Some(dry_run) = std::env::var("DRY_RUN").ok().and_then(|v| parse_bool(&v)) {
            self.trading.dry_run = dry_run;
        }
    }

    /// Reject configurations the process must not start with
    pub fn validate(&self) -> TradingResult<()> {
        self.regime.thresholds().validate()?;
        parse_timeframe(&self.regime.timeframe)?;
        if self.regime.adx_period == 0 {
            return Err(TradingError::Config("regime.adx_period must be > 0".into()));
        }
        if self.regime.cooldown_minutes <= 0 {
            return Err(TradingError::Config("regime.cooldown_minutes must be > 0".into()));
        }
        if self.regime.candle_limit < crate::indicators::adx_warmup(self.regime.adx_period) + 1 {
            return Err(TradingError::Config(format!(
                "regime.candle_limit ({}) too small for ADX({})",
                self.regime.candle_limit, self.regime.adx_period
            )));
        }

        self.mean_reversion.validate()?;
        self.trend_sniper.validate()?;
        self.trading.validate()?;

        let retry = &self.exchange.retry;
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(TradingError::Config(
                "exchange.retry.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }
        let backoff = &self.trading.failure_backoff;
        if backoff.max_delay_ms < backoff.initial_delay_ms {
            return Err(TradingError::Config(
                "trading.failure_backoff.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }

        if !self.trading.dry_run && self.exchange.credentials().is_none() {
            return Err(TradingError::Config(
                "live trading needs BINANCE_API_KEY and BINANCE_API_SECRET".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// "futures" (USD-M perpetuals, default) or "spot"
    pub market: BinanceMarket,
    /// REST host override, e.g. "https://testnet.binancefuture.com"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request retry for transient failures
    pub retry: RetryPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            market: BinanceMarket::default(),
            base_url: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExchangeConfig {
    /// Configured host, or the market's production host
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.market.default_base_url())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials::new(key.clone(), secret.clone()))
            }
            _ => None,
        }
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Instrument, "BASE/QUOTE" (default: "BTC/USDT")
    pub symbol: String,
    /// Share of the quote balance committed per entry, percent (default: 5.0)
    pub position_size_percent: f64,
    /// Entries smaller than this base-asset size are skipped (default: 0.00001)
    pub min_order_size: f64,
    /// Poll interval (default: 60)
    pub loop_interval_seconds: u64,
    /// Log decisions and simulate fills instead of placing orders (default: true)
    pub dry_run: bool,
    /// Starting quote balance of the paper account (default: 10000)
    pub simulated_balance: f64,
    /// Backoff between failed cycles
    pub failure_backoff: RetryPolicy,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbol: "BTC/USDT".to_string(),
            position_size_percent: 5.0,
            min_order_size: 0.00001,
            loop_interval_seconds: 60,
            dry_run: true,
            simulated_balance: 10_000.0,
            failure_backoff: RetryPolicy::new(
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(300),
                Some(5),
            ),
        }
    }
}

impl TradingConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(self.symbol.clone())
    }

    /// "BTC/USDT" -> "USDT"; pairs without a separator are assumed USDT-quoted
    pub fn quote_asset(&self) -> &str {
        self.symbol.split_once('/').map(|(_, quote)| quote).unwrap_or("USDT")
    }

    fn validate(&self) -> TradingResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(TradingError::Config("trading.symbol must be set".into()));
        }
        if !(self.position_size_percent > 0.0 && self.position_size_percent <= 100.0) {
            return Err(TradingError::Config(format!(
                "trading.position_size_percent ({}) must be in (0, 100]",
                self.position_size_percent
            )));
        }
        if self.min_order_size < 0.0 {
            return Err(TradingError::Config("trading.min_order_size must be >= 0".into()));
        }
        if self.loop_interval_seconds == 0 {
            return Err(TradingError::Config("trading.loop_interval_seconds must be > 0".into()));
        }
        if self.dry_run && self.simulated_balance <= 0.0 {
            return Err(TradingError::Config("trading.simulated_balance must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file (default: "data/trades.db")
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: "data/trades.db".to_string(),
        }
    }
}
