//! Technical indicators powered by the `ta` crate
//!
//! Every function returns a series aligned with its input: index `i` of the
//! output belongs to candle `i`, and warmup positions are `None`. Callers
//! read the value they need through [`latest`] / [`back`], which fail with
//! [`TradingError::DataInsufficient`] instead of inventing a default.
//!
//! SMA, EMA, RSI and Bollinger Bands come from `ta`. ATR, DMI and ADX use
//! Wilder's smoothing, and the Donchian channel is a plain rolling max/min.

use ta::indicators::{
    BollingerBands as TaBB, ExponentialMovingAverage, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::Next;

use crate::error::{TradingError, TradingResult};
use crate::types::Candle;

// =============================================================================
// Type Aliases
// =============================================================================

/// (upper, middle, lower)
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// (upper, lower)
pub type ChannelOutput = (Vec<Option<f64>>, Vec<Option<f64>>);

// =============================================================================
// Candle columns
// =============================================================================

/// Column view of a candle slice, the shape every indicator here consumes
#[derive(Debug, Clone, Default)]
pub struct PriceColumns {
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
}

impl PriceColumns {
    pub fn from_candles(candles: &[Candle]) -> Self {
        PriceColumns {
            high: candles.iter().map(|c| c.high).collect(),
            low: candles.iter().map(|c| c.low).collect(),
            close: candles.iter().map(|c| c.close).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }
}

// =============================================================================
// Reading values
// =============================================================================

/// Value for the most recent candle, or `DataInsufficient`
pub fn latest(series: &[Option<f64>], name: &str, required: usize) -> TradingResult<f64> {
    back(series, 0, name, required)
}

/// Value `offset` candles before the most recent one
pub fn back(series: &[Option<f64>], offset: usize, name: &str, required: usize) -> TradingResult<f64> {
    series
        .len()
        .checked_sub(offset + 1)
        .and_then(|idx| series[idx])
        .filter(|v| v.is_finite())
        .ok_or_else(|| TradingError::data_insufficient(name, required + offset, series.len()))
}

// =============================================================================
// Moving Averages
// =============================================================================

/// Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    warmed_up(values.iter().map(|&v| indicator.next(v)), period)
}

/// Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    warmed_up(values.iter().map(|&v| indicator.next(v)), period)
}

/// Mask the first `period - 1` outputs of a streaming indicator
fn warmed_up(outputs: impl Iterator<Item = f64>, period: usize) -> Vec<Option<f64>> {
    outputs
        .enumerate()
        .map(|(i, v)| if i + 1 >= period { Some(v) } else { None })
        .collect()
}

// =============================================================================
// Volatility
// =============================================================================

/// True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..high.len())
        .map(|i| {
            let hl = high[i] - low[i];
            if i == 0 {
                hl
            } else {
                let hc = (high[i] - close[i - 1]).abs();
                let lc = (low[i] - close[i - 1]).abs();
                hl.max(hc).max(lc)
            }
        })
        .collect()
}

/// Average True Range with Wilder's smoothing
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    wilders_smooth(&true_range(high, low, close), period)
}

/// Bollinger Bands (population standard deviation, as `ta` computes it)
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        if i + 1 >= period {
            upper.push(Some(bb.upper));
            middle.push(Some(bb.average));
            lower.push(Some(bb.lower));
        } else {
            upper.push(None);
            middle.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

/// Donchian channel: highest high and lowest low of the last `period` candles,
/// the current candle included
pub fn donchian(high: &[f64], low: &[f64], period: usize) -> ChannelOutput {
    if high.is_empty() || period == 0 || high.len() != low.len() {
        return (vec![], vec![]);
    }

    let mut upper = Vec::with_capacity(high.len());
    let mut lower = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        if i + 1 < period {
            upper.push(None);
            lower.push(None);
            continue;
        }
        let window = i + 1 - period..=i;
        upper.push(Some(high[window.clone()].iter().copied().fold(f64::MIN, f64::max)));
        lower.push(Some(low[window].iter().copied().fold(f64::MAX, f64::min)));
    }

    (upper, lower)
}

// =============================================================================
// Momentum
// =============================================================================

/// Relative Strength Index
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    // First change is only known at index 1, so one extra candle of warmup
    warmed_up(values.iter().map(|&v| indicator.next(v)), period + 1)
}

// =============================================================================
// Trend strength
// =============================================================================

/// Wilder's smoothing: new = (prev * (period - 1) + current) / period,
/// seeded with the SMA of the first `period` values
fn wilders_smooth(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = Vec::with_capacity(values.len());
    let mut smoothed: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
            continue;
        }
        let next = match smoothed {
            None => values[0..period].iter().sum::<f64>() / period as f64,
            Some(prev) => (prev * (period - 1) as f64 + value) / period as f64,
        };
        smoothed = Some(next);
        result.push(smoothed);
    }

    result
}

/// Directional Movement Index components, returns (+DI, -DI)
pub fn dmi(high: &[f64], low: &[f64], close: &[f64], period: usize) -> ChannelOutput {
    if high.is_empty() || period == 0 {
        return (vec![], vec![]);
    }

    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let smoothed_plus = wilders_smooth(&plus_dm, period);
    let smoothed_minus = wilders_smooth(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = Vec::with_capacity(high.len());
    let mut minus_di = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        match (smoothed_plus[i], smoothed_minus[i], atr_values[i]) {
            (Some(pdm), Some(mdm), Some(atr_val)) if atr_val > 0.0 => {
                plus_di.push(Some(pdm / atr_val * 100.0));
                minus_di.push(Some(mdm / atr_val * 100.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Average Directional Index
///
/// First value lands on index `2 * period - 2`: one period for the DI lines,
/// another to smooth DX.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 {
        return vec![];
    }

    let (plus_di, minus_di) = dmi(high, low, close, period);
    let di_start = period - 1;
    let mut result = vec![None; high.len()];

    if high.len() <= di_start {
        return result;
    }

    let dx: Vec<f64> = (di_start..high.len())
        .map(|i| match (plus_di[i], minus_di[i]) {
            (Some(pdi), Some(mdi)) if pdi + mdi > 0.0 => (pdi - mdi).abs() / (pdi + mdi) * 100.0,
            _ => 0.0,
        })
        .collect();

    for (j, value) in wilders_smooth(&dx, period).into_iter().enumerate() {
        result[di_start + j] = value;
    }

    result
}

/// Candles needed before [`adx`] yields its first value
pub fn adx_warmup(period: usize) -> usize {
    2 * period - 1
}
