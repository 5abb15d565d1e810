//! Regime detection configuration

use serde::{Deserialize, Serialize};

use super::detector::RegimeThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Timeframe the ADX is computed on (default: "1h")
    pub timeframe: String,
    /// ADX period (default: 14)
    pub adx_period: usize,
    /// RANGING -> TRENDING once ADX rises above this (default: 25)
    pub trend_start: f64,
    /// TRENDING -> RANGING once ADX falls below this (default: 20)
    pub range_return: f64,
    /// Entry suppression window after a regime change (default: 15)
    pub cooldown_minutes: i64,
    /// Candles requested per fetch (default: 100)
    pub candle_limit: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            timeframe: "1h".to_string(),
            adx_period: 14,
            trend_start: 25.0,
            range_return: 20.0,
            cooldown_minutes: 15,
            candle_limit: 100,
        }
    }
}

impl RegimeConfig {
    pub fn thresholds(&self) -> RegimeThresholds {
        RegimeThresholds {
            trend_start: self.trend_start,
            range_return: self.range_return,
        }
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }
}
