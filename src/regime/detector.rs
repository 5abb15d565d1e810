//! ADX hysteresis state machine
//!
//! ## Transition rules
//! - RANGING -> TRENDING iff ADX > `trend_start`
//! - TRENDING -> RANGING iff ADX < `range_return`
//!
//! Readings inside `[range_return, trend_start]` never change the state, so
//! an ADX hovering around a single level cannot make the regime flap. The
//! first reading has no prior state and is classified without hysteresis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{RegimeChangeEvent, RegimeSnapshot, RegimeState};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub trend_start: f64,
    pub range_return: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        RegimeThresholds {
            trend_start: 25.0,
            range_return: 20.0,
        }
    }
}

impl RegimeThresholds {
    pub fn new(trend_start: f64, range_return: f64) -> TradingResult<Self> {
        let thresholds = RegimeThresholds {
            trend_start,
            range_return,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// A dead zone must exist between the two thresholds
    pub fn validate(&self) -> TradingResult<()> {
        if !self.trend_start.is_finite() || !self.range_return.is_finite() {
            return Err(TradingError::Config("regime thresholds must be finite".into()));
        }
        if self.range_return >= self.trend_start {
            return Err(TradingError::Config(format!(
                "range_return ({}) must be below trend_start ({})",
                self.range_return, self.trend_start
            )));
        }
        Ok(())
    }

    /// Classification without memory, used only for the seed reading
    pub fn classify(&self, adx: f64) -> RegimeState {
        if adx >= self.trend_start {
            RegimeState::Trending
        } else {
            RegimeState::Ranging
        }
    }

    /// Next state given the current one
    pub fn next_state(&self, current: RegimeState, adx: f64) -> RegimeState {
        match current {
            RegimeState::Ranging if adx > self.trend_start => RegimeState::Trending,
            RegimeState::Trending if adx < self.range_return => RegimeState::Ranging,
            unchanged => unchanged,
        }
    }
}

/// Owns the regime snapshot for the process lifetime
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    thresholds: RegimeThresholds,
    snapshot: RegimeSnapshot,
}

impl RegimeDetector {
    /// Create the detector from the first ADX reading.
    ///
    /// Seeding is not a transition: `last_change_at` stays `None`, so no
    /// cooldown runs at startup.
    pub fn seed(thresholds: RegimeThresholds, adx: f64) -> TradingResult<Self> {
        thresholds.validate()?;
        if !adx.is_finite() {
            return Err(TradingError::data_insufficient("adx seed", 1, 0));
        }

        let current = thresholds.classify(adx);
        info!("Regime seeded as {} (ADX {:.2})", current, adx);

        Ok(RegimeDetector {
            thresholds,
            snapshot: RegimeSnapshot {
                current,
                last_change_at: None,
                last_adx: adx,
            },
        })
    }

    /// Feed one ADX reading. Changes the state at most once.
    pub fn evaluate(&mut self, adx: f64, now: DateTime<Utc>) -> Option<RegimeChangeEvent> {
        if !adx.is_finite() {
            debug!("Ignoring non-finite ADX reading");
            return None;
        }

        self.snapshot.last_adx = adx;
        let old = self.snapshot.current;
        let new = self.thresholds.next_state(old, adx);

        if new == old {
            debug!("Regime stays {} (ADX {:.2})", old, adx);
            return None;
        }

        self.snapshot.current = new;
        self.snapshot.last_change_at = Some(now);
        info!(adx, "REGIME CHANGE: {} -> {} (ADX {:.2})", old, new, adx);

        Some(RegimeChangeEvent {
            old,
            new,
            adx_value: adx,
            at: now,
        })
    }

    pub fn snapshot(&self) -> RegimeSnapshot {
        self.snapshot
    }

    pub fn current(&self) -> RegimeState {
        self.snapshot.current
    }

    pub fn thresholds(&self) -> RegimeThresholds {
        self.thresholds
    }
}
