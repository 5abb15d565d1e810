//! Trend Sniper Strategy Configuration

use serde::{Deserialize, Serialize};

use crate::error::{TradingError, TradingResult};
use crate::market::parse_timeframe;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendSniperConfig {
    /// Candle timeframe (default: "1h")
    pub timeframe: String,
    /// Donchian channel lookback (default: 20)
    pub donchian_period: usize,
    /// Trend filter EMA period (default: 200)
    pub ema_period: usize,
    /// Candles requested per fetch (default: 300)
    pub candle_limit: usize,
}

impl Default for TrendSniperConfig {
    fn default() -> Self {
        TrendSniperConfig {
            timeframe: "1h".to_string(),
            donchian_period: 20,
            ema_period: 200,
            candle_limit: 300,
        }
    }
}

impl TrendSniperConfig {
    /// Closed candles needed for an entry decision. The breakout channel
    /// excludes the latest candle, hence the extra one.
    pub fn warmup(&self) -> usize {
        self.ema_period.max(self.donchian_period + 1)
    }

    pub fn validate(&self) -> TradingResult<()> {
        parse_timeframe(&self.timeframe)?;

        if self.donchian_period == 0 || self.ema_period == 0 {
            return Err(TradingError::Config("trend_sniper periods must be > 0".into()));
        }
        if self.candle_limit <= self.warmup() {
            return Err(TradingError::Config(format!(
                "trend_sniper candle_limit ({}) must exceed warmup ({})",
                self.candle_limit,
                self.warmup()
            )));
        }
        Ok(())
    }
}
