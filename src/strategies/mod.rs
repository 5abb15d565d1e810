//! Strategy signal engines
//!
//! Each engine owns at most one open [`Position`] and produces entry and exit
//! intents for its own timeframe. Whether an entry may actually be taken is
//! decided by the orchestrator's activation gate, never by the engine; exit
//! evaluation runs every cycle while a position is open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TradingResult;
use crate::market::MarketView;
use crate::regime::RegimeState;
use crate::types::{Candle, OrderResult, Position, Side, StrategyId};

pub mod mean_reversion;
pub mod trend_sniper;

pub use mean_reversion::{MeanReversionConfig, MeanReversionStrategy};
pub use trend_sniper::{TrendSniperConfig, TrendSniperStrategy};

/// Request to open a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryIntent {
    pub strategy: StrategyId,
    pub side: Side,
    /// Price the decision was made at (latest closed close)
    pub reference_price: f64,
    pub stop_level: f64,
    pub target_level: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to close the engine's open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitIntent {
    pub strategy: StrategyId,
    pub reason: ExitReason,
    /// Level the exit triggered at, or the open when the candle gapped through it
    pub reference_price: f64,
    pub detail: String,
}

/// Price at which `bar` crossed the stop of a `side` position, if it did.
///
/// A candle that opened beyond the stop fills at its open.
pub fn stop_touched(side: Side, stop_level: f64, bar: &Candle) -> Option<f64> {
    match side {
        Side::Long if bar.low <= stop_level => Some(bar.open.min(stop_level)),
        Side::Short if bar.high >= stop_level => Some(bar.open.max(stop_level)),
        _ => None,
    }
}

/// Price at which `bar` reached a profit target of a `side` position, if it did
pub fn target_touched(side: Side, target: f64, bar: &Candle) -> Option<f64> {
    match side {
        Side::Long if bar.high >= target => Some(bar.open.max(target)),
        Side::Short if bar.low <= target => Some(bar.open.min(target)),
        _ => None,
    }
}

/// Capability interface shared by both engines
pub trait SignalEngine: Send + Sync {
    fn id(&self) -> StrategyId;

    /// Candle timeframe this engine trades on
    fn timeframe(&self) -> &str;

    /// Regime in which the engine may open new positions
    fn required_regime(&self) -> RegimeState;

    /// Candles to request per fetch
    fn candle_limit(&self) -> usize;

    fn position(&self) -> Option<&Position>;

    fn has_position(&self) -> bool {
        self.position().is_some()
    }

    /// Entry decision on the latest closed candle. Always `None` while a
    /// position is open.
    fn evaluate_entry(&self, view: &MarketView) -> TradingResult<Option<EntryIntent>>;

    /// Exit decision for the open position over the latest closed candle's
    /// range, `None` when flat
    fn evaluate_exit(&self, view: &MarketView) -> TradingResult<Option<ExitIntent>>;

    /// Move the stop of the open position if the strategy trails it.
    /// Returns the new stop when it moved.
    fn manage_stop(&mut self, _view: &MarketView) -> TradingResult<Option<f64>> {
        Ok(None)
    }

    /// Record a filled entry
    fn open_position(&mut self, intent: &EntryIntent, fill: &OrderResult, now: DateTime<Utc>) -> &Position;

    /// Clear the open position after a filled exit
    fn close_position(&mut self) -> Option<Position>;

    /// Reinstate a position persisted before a restart
    fn restore_position(&mut self, position: Position);
}

/// Build a [`Position`] from an intent and its fill
pub(crate) fn position_from_fill(
    intent: &EntryIntent,
    fill: &OrderResult,
    stop_level: f64,
    now: DateTime<Utc>,
) -> Position {
    Position {
        strategy: intent.strategy,
        side: intent.side,
        entry_price: fill.filled_price,
        size: fill.filled_size,
        entry_time: now,
        stop_level,
        target_level: intent.target_level,
    }
}
