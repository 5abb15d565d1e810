//! Trend Sniper Strategy
//!
//! ## Entry (latest closed 1h candle)
//! - LONG: close > EMA200 AND close > highest high of the previous 20 candles
//! - SHORT: close < EMA200 AND close < lowest low of the previous 20 candles
//!
//! The breakout channel stops one candle short of the latest, since a close can
//! never exceed a channel that already contains its own high.
//!
//! ## Stop management
//! The stop starts at the opposite band of the channel that includes the latest
//! candle, and every cycle it moves to the new band only when that tightens it.
//! The EMA filter applies to entries only. The exit fires when the latest
//! closed candle's range crosses the stop.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::config::TrendSniperConfig;
use crate::error::{TradingError, TradingResult};
use crate::indicators::{back, donchian, ema, latest, PriceColumns};
use crate::market::MarketView;
use crate::regime::RegimeState;
use crate::strategies::{position_from_fill, stop_touched, EntryIntent, ExitIntent, ExitReason, SignalEngine};
use crate::types::{Candle, OrderResult, Position, Side, StrategyId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendSnapshot {
    pub close: f64,
    pub ema: f64,
    /// Channel of the `period` candles before the latest one
    pub breakout_high: f64,
    pub breakout_low: f64,
    /// Channel including the latest candle
    pub channel_high: f64,
    pub channel_low: f64,
}

/// Pure entry rule
pub fn decide_entry(snap: &TrendSnapshot) -> Option<EntryIntent> {
    if snap.close > snap.ema && snap.close > snap.breakout_high {
        return Some(EntryIntent {
            strategy: StrategyId::TrendSniper,
            side: Side::Long,
            reference_price: snap.close,
            stop_level: snap.channel_low,
            target_level: None,
            reason: format!(
                "Breakout: close ({:.2}) > Donchian high ({:.2}), above EMA ({:.2})",
                snap.close, snap.breakout_high, snap.ema
            ),
        });
    }

    if snap.close < snap.ema && snap.close < snap.breakout_low {
        return Some(EntryIntent {
            strategy: StrategyId::TrendSniper,
            side: Side::Short,
            reference_price: snap.close,
            stop_level: snap.channel_high,
            target_level: None,
            reason: format!(
                "Breakdown: close ({:.2}) < Donchian low ({:.2}), below EMA ({:.2})",
                snap.close, snap.breakout_low, snap.ema
            ),
        });
    }

    None
}

/// Pure exit rule: the stop is the only exit, checked against the candle's range
pub fn decide_exit(position: &Position, bar: &Candle) -> Option<ExitIntent> {
    stop_touched(position.side, position.stop_level, bar).map(|price| ExitIntent {
        strategy: StrategyId::TrendSniper,
        reason: ExitReason::StopLoss,
        reference_price: price,
        detail: format!(
            "Trailing stop hit: range [{:.2}, {:.2}] crossed stop ({:.2})",
            bar.low, bar.high, position.stop_level
        ),
    })
}

/// New stop when the opposite band tightens it, never loosening
pub fn trail_stop(position: &Position, channel_high: f64, channel_low: f64) -> Option<f64> {
    match position.side {
        Side::Long if channel_low > position.stop_level => Some(channel_low),
        Side::Short if channel_high < position.stop_level => Some(channel_high),
        _ => None,
    }
}

pub struct TrendSniperStrategy {
    config: TrendSniperConfig,
    position: Option<Position>,
}

impl TrendSniperStrategy {
    pub fn new(config: TrendSniperConfig) -> Self {
        TrendSniperStrategy {
            config,
            position: None,
        }
    }

    pub fn config(&self) -> &TrendSniperConfig {
        &self.config
    }

    /// Current channel (latest candle included), needs only `donchian_period` candles
    fn current_channel(&self, cols: &PriceColumns) -> TradingResult<(f64, f64)> {
        let period = self.config.donchian_period;
        let (upper, lower) = donchian(&cols.high, &cols.low, period);
        Ok((latest(&upper, "donchian_high", period)?, latest(&lower, "donchian_low", period)?))
    }

    pub fn snapshot(&self, candles: &[Candle]) -> TradingResult<TrendSnapshot> {
        let cols = PriceColumns::from_candles(candles);
        let period = self.config.donchian_period;

        let close = cols
            .close
            .last()
            .copied()
            .ok_or_else(|| TradingError::data_insufficient("close", 1, 0))?;
        let ema_values = ema(&cols.close, self.config.ema_period);
        let (upper, lower) = donchian(&cols.high, &cols.low, period);

        Ok(TrendSnapshot {
            close,
            ema: latest(&ema_values, "ema", self.config.ema_period)?,
            breakout_high: back(&upper, 1, "donchian_high", period)?,
            breakout_low: back(&lower, 1, "donchian_low", period)?,
            channel_high: latest(&upper, "donchian_high", period)?,
            channel_low: latest(&lower, "donchian_low", period)?,
        })
    }
}

impl SignalEngine for TrendSniperStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::TrendSniper
    }

    fn timeframe(&self) -> &str {
        &self.config.timeframe
    }

    fn required_regime(&self) -> RegimeState {
        RegimeState::Trending
    }

    fn candle_limit(&self) -> usize {
        self.config.candle_limit
    }

    fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    fn evaluate_entry(&self, view: &MarketView) -> TradingResult<Option<EntryIntent>> {
        if self.position.is_some() {
            return Ok(None);
        }

        let snap = self.snapshot(&view.candles)?;
        debug!(
            "TS close={:.2} ema={:.2} breakout=[{:.2}, {:.2}]",
            snap.close, snap.ema, snap.breakout_low, snap.breakout_high
        );
        Ok(decide_entry(&snap))
    }

    fn evaluate_exit(&self, view: &MarketView) -> TradingResult<Option<ExitIntent>> {
        let Some(position) = &self.position else {
            return Ok(None);
        };

        Ok(decide_exit(position, &view.bar_since(position.entry_time)?))
    }

    fn manage_stop(&mut self, view: &MarketView) -> TradingResult<Option<f64>> {
        let Some(position) = self.position.as_ref() else {
            return Ok(None);
        };

        let (channel_high, channel_low) = self.current_channel(&PriceColumns::from_candles(&view.candles))?;
        let Some(new_stop) = trail_stop(position, channel_high, channel_low) else {
            return Ok(None);
        };

        if let Some(position) = self.position.as_mut() {
            info!(
                "Trailing stop {} {:.2} -> {:.2}",
                position.side, position.stop_level, new_stop
            );
            position.stop_level = new_stop;
        }
        Ok(Some(new_stop))
    }

    fn open_position(&mut self, intent: &EntryIntent, fill: &OrderResult, now: DateTime<Utc>) -> &Position {
        self.position.insert(position_from_fill(intent, fill, intent.stop_level, now))
    }

    fn close_position(&mut self) -> Option<Position> {
        self.position.take()
    }

    fn restore_position(&mut self, position: Position) {
        self.position = Some(position);
    }
}
