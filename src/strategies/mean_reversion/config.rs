//! Mean Reversion Strategy Configuration

use serde::{Deserialize, Serialize};

use crate::error::{TradingError, TradingResult};
use crate::market::parse_timeframe;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanReversionConfig {
    /// Candle timeframe (default: "15m")
    pub timeframe: String,

    // === Bollinger Band Parameters ===
    /// Bollinger Band period, also the SMA exit target period (default: 20)
    pub bb_period: usize,
    /// Standard deviation multiplier (default: 2.0)
    pub bb_std: f64,

    // === RSI Parameters ===
    /// RSI period (default: 14)
    pub rsi_period: usize,
    /// Long entries need RSI below this (default: 30)
    pub rsi_oversold: f64,
    /// Short entries need RSI above this (default: 70)
    pub rsi_overbought: f64,

    // === Risk Management Parameters ===
    /// ATR period for stop sizing (default: 14)
    pub atr_period: usize,
    /// Stop distance in ATRs (default: 1.5)
    pub stop_atr_multiple: f64,

    /// Candles requested per fetch (default: 300)
    pub candle_limit: usize,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        MeanReversionConfig {
            timeframe: "15m".to_string(),
            bb_period: 20,
            bb_std: 2.0,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            atr_period: 14,
            stop_atr_multiple: 1.5,
            candle_limit: 300,
        }
    }
}

impl MeanReversionConfig {
    /// Closed candles needed before every indicator has a value
    pub fn warmup(&self) -> usize {
        self.bb_period.max(self.rsi_period + 1).max(self.atr_period)
    }

    pub fn validate(&self) -> TradingResult<()> {
        parse_timeframe(&self.timeframe)?;

        if self.bb_period == 0 || self.rsi_period == 0 || self.atr_period == 0 {
            return Err(TradingError::Config("mean_reversion periods must be > 0".into()));
        }
        if self.bb_std <= 0.0 || self.stop_atr_multiple <= 0.0 {
            return Err(TradingError::Config(
                "mean_reversion bb_std and stop_atr_multiple must be > 0".into(),
            ));
        }
        if !(0.0 < self.rsi_oversold && self.rsi_oversold < self.rsi_overbought && self.rsi_overbought < 100.0) {
            return Err(TradingError::Config(format!(
                "mean_reversion RSI thresholds must satisfy 0 < oversold ({}) < overbought ({}) < 100",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if self.candle_limit <= self.warmup() {
            return Err(TradingError::Config(format!(
                "mean_reversion candle_limit ({}) must exceed warmup ({})",
                self.candle_limit,
                self.warmup()
            )));
        }
        Ok(())
    }
}
