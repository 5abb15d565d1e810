//! Market regime classification
//!
//! The detector turns hourly ADX readings into a two-state regime with
//! hysteresis, and the cooldown timer suppresses new entries for a fixed
//! window after every regime change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod cooldown;
pub mod detector;

pub use config::RegimeConfig;
pub use cooldown::CooldownTimer;
pub use detector::{RegimeDetector, RegimeThresholds};

/// Market regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeState {
    Ranging,
    Trending,
}

impl RegimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeState::Ranging => "RANGING",
            RegimeState::Trending => "TRENDING",
        }
    }
}

impl std::fmt::Display for RegimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the detector's state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub current: RegimeState,
    /// Time of the last real transition; `None` while still on the seed state
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_adx: f64,
}

/// Emitted once per transition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeChangeEvent {
    pub old: RegimeState,
    pub new: RegimeState,
    pub adx_value: f64,
    pub at: DateTime<Utc>,
}
