//! Mean Reversion Strategy
//!
//! ## Entry (latest closed 15m candle)
//! - LONG: close < lower band AND RSI < oversold
//! - SHORT: close > upper band AND RSI > overbought
//!
//! Stop is `entry ∓ stop_atr_multiple × ATR`, target is the 20-period SMA.
//!
//! ## Exit (high/low of the latest closed candle)
//! 1. Range crosses the stop (checked first, so a candle that reaches both
//!    levels exits on the stop)
//! 2. Range reaches the current SMA

use chrono::{DateTime, Utc};
use tracing::debug;

use super::config::MeanReversionConfig;
use crate::error::{TradingError, TradingResult};
use crate::indicators::{atr, bollinger_bands, latest, rsi, PriceColumns};
use crate::market::MarketView;
use crate::regime::RegimeState;
use crate::strategies::{
    position_from_fill, stop_touched, target_touched, EntryIntent, ExitIntent, ExitReason, SignalEngine,
};
use crate::types::{Candle, OrderResult, Position, Side, StrategyId};

/// Indicator values on the latest closed candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanReversionSnapshot {
    pub close: f64,
    pub bb_upper: f64,
    pub bb_lower: f64,
    pub rsi: f64,
    pub sma: f64,
    pub atr: f64,
}

/// Pure entry rule
pub fn decide_entry(config: &MeanReversionConfig, snap: &MeanReversionSnapshot) -> Option<EntryIntent> {
    let stop_distance = snap.atr * config.stop_atr_multiple;

    if snap.close < snap.bb_lower && snap.rsi < config.rsi_oversold {
        return Some(EntryIntent {
            strategy: StrategyId::MeanReversion,
            side: Side::Long,
            reference_price: snap.close,
            stop_level: snap.close - stop_distance,
            target_level: Some(snap.sma),
            reason: format!(
                "Oversold: close ({:.2}) < BB lower ({:.2}), RSI ({:.1}) < {}",
                snap.close, snap.bb_lower, snap.rsi, config.rsi_oversold
            ),
        });
    }

    if snap.close > snap.bb_upper && snap.rsi > config.rsi_overbought {
        return Some(EntryIntent {
            strategy: StrategyId::MeanReversion,
            side: Side::Short,
            reference_price: snap.close,
            stop_level: snap.close + stop_distance,
            target_level: Some(snap.sma),
            reason: format!(
                "Overbought: close ({:.2}) > BB upper ({:.2}), RSI ({:.1}) > {}",
                snap.close, snap.bb_upper, snap.rsi, config.rsi_overbought
            ),
        });
    }

    None
}

/// Pure exit rule over the latest closed candle's range. `mean` is the
/// current SMA when it could be computed.
pub fn decide_exit(position: &Position, bar: &Candle, mean: Option<f64>) -> Option<ExitIntent> {
    let (low, high) = (bar.low, bar.high);

    if let Some(price) = stop_touched(position.side, position.stop_level, bar) {
        return Some(ExitIntent {
            strategy: StrategyId::MeanReversion,
            reason: ExitReason::StopLoss,
            reference_price: price,
            detail: format!(
                "Stop hit: range [{:.2}, {:.2}] crossed stop ({:.2})",
                low, high, position.stop_level
            ),
        });
    }

    let mean = mean?;
    target_touched(position.side, mean, bar).map(|price| ExitIntent {
        strategy: StrategyId::MeanReversion,
        reason: ExitReason::TakeProfit,
        reference_price: price,
        detail: format!("Target: range [{:.2}, {:.2}] reached SMA ({:.2})", low, high, mean),
    })
}

pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
    position: Option<Position>,
}

impl MeanReversionStrategy {
    pub fn new(config: MeanReversionConfig) -> Self {
        MeanReversionStrategy {
            config,
            position: None,
        }
    }

    pub fn config(&self) -> &MeanReversionConfig {
        &self.config
    }

    /// Indicator values on the latest candle, or `DataInsufficient`
    pub fn snapshot(&self, candles: &[Candle]) -> TradingResult<MeanReversionSnapshot> {
        let cols = PriceColumns::from_candles(candles);
        let cfg = &self.config;

        let (upper, middle, lower) = bollinger_bands(&cols.close, cfg.bb_period, cfg.bb_std);
        let rsi_values = rsi(&cols.close, cfg.rsi_period);
        let atr_values = atr(&cols.high, &cols.low, &cols.close, cfg.atr_period);

        let close = cols
            .close
            .last()
            .copied()
            .ok_or_else(|| TradingError::data_insufficient("close", 1, 0))?;

        Ok(MeanReversionSnapshot {
            close,
            bb_upper: latest(&upper, "bb_upper", cfg.bb_period)?,
            bb_lower: latest(&lower, "bb_lower", cfg.bb_period)?,
            rsi: latest(&rsi_values, "rsi", cfg.rsi_period + 1)?,
            sma: latest(&middle, "sma", cfg.bb_period)?,
            atr: latest(&atr_values, "atr", cfg.atr_period)?,
        })
    }
}

impl SignalEngine for MeanReversionStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::MeanReversion
    }

    fn timeframe(&self) -> &str {
        &self.config.timeframe
    }

    fn required_regime(&self) -> RegimeState {
        RegimeState::Ranging
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
            "MR close={:.2} bb=[{:.2}, {:.2}] rsi={:.1} sma={:.2} atr={:.2}",
            snap.close, snap.bb_lower, snap.bb_upper, snap.rsi, snap.sma, snap.atr
        );
        Ok(decide_entry(&self.config, &snap))
    }

    fn evaluate_exit(&self, view: &MarketView) -> TradingResult<Option<ExitIntent>> {
        let Some(position) = &self.position else {
            return Ok(None);
        };

        let bar = view.bar_since(position.entry_time)?;
        // Stop checks only need the candle; without a fresh SMA fall back to the entry target
        let mean = match self.snapshot(&view.candles) {
            Ok(snap) => Some(snap.sma),
            Err(e) if e.is_data_insufficient() => position.target_level,
            Err(e) => return Err(e),
        };

        Ok(decide_exit(position, &bar, mean))
    }

    fn open_position(&mut self, intent: &EntryIntent, fill: &OrderResult, now: DateTime<Utc>) -> &Position {
        // Keep the ATR distance, anchored on the actual fill
        let stop_distance = (intent.reference_price - intent.stop_level).abs();
        let stop_level = match intent.side {
            Side::Long => fill.filled_price - stop_distance,
            Side::Short => fill.filled_price + stop_distance,
        };
        self.position.insert(position_from_fill(intent, fill, stop_level, now))
    }

    fn close_position(&mut self) -> Option<Position> {
        self.position.take()
    }

    fn restore_position(&mut self, position: Position) {
        self.position = Some(position);
    }
}
