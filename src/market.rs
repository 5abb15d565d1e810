//! Market data helpers: timeframes and closed-candle views

use chrono::{DateTime, Duration, Utc};

use crate::error::{TradingError, TradingResult};
use crate::types::Candle;

/// Parse an exchange timeframe string ("1m", "15m", "1h", "4h", "1d", "1w")
pub fn parse_timeframe(timeframe: &str) -> TradingResult<Duration> {
    let tf = timeframe.trim();
    let invalid = || TradingError::Config(format!("invalid timeframe '{}'", timeframe));

    let unit = tf.chars().last().ok_or_else(invalid)?;
    let amount: i64 = tf[..tf.len() - unit.len_utf8()]
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(invalid)?;

    match unit {
        'm' => Ok(Duration::minutes(amount)),
        'h' => Ok(Duration::hours(amount)),
        'd' => Ok(Duration::days(amount)),
        'w' => Ok(Duration::weeks(amount)),
        _ => Err(TradingError::Config(format!(
            "invalid timeframe '{}': unit must be one of m, h, d, w",
            timeframe
        ))),
    }
}

/// Drop every candle that has not closed yet at `now`.
///
/// Exchanges return the in-progress candle as the last element; its values
/// keep changing until `open_time + timeframe`.
pub fn closed_candles(candles: Vec<Candle>, timeframe: Duration, now: DateTime<Utc>) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| c.datetime + timeframe <= now)
        .collect()
}

/// Closed candles for one timeframe, as handed to the strategy engines
#[derive(Debug, Clone)]
pub struct MarketView {
    pub timeframe: String,
    pub candles: Vec<Candle>,
}

impl MarketView {
    pub fn new(timeframe: impl Into<String>, candles: Vec<Candle>) -> Self {
        MarketView {
            timeframe: timeframe.into(),
            candles,
        }
    }

    /// Latest closed candle
    pub fn last_candle(&self) -> TradingResult<&Candle> {
        self.candles
            .last()
            .ok_or_else(|| TradingError::data_insufficient(format!("candle[{}]", self.timeframe), 1, 0))
    }

    /// Latest closed candle as seen by a position opened at `since`.
    ///
    /// A candle that had already closed by then has no range the position
    /// lived through, so it collapses to its close.
    pub fn bar_since(&self, since: DateTime<Utc>) -> TradingResult<Candle> {
        let last = self.last_candle()?;
        if last.datetime + parse_timeframe(&self.timeframe)? > since {
            return Ok(last.clone());
        }
        Ok(Candle {
            open: last.close,
            high: last.close,
            low: last.close,
            ..last.clone()
        })
    }

    /// Close of the latest closed candle
    pub fn price(&self) -> TradingResult<f64> {
        self.last_candle().map(|c| c.close)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(minute: u32) -> Candle {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap();
        Candle::new(t, 100.0, 101.0, 99.0, 100.0, 1.0).unwrap()
    }

    #[test]
    fn test_parse_timeframe() {
        assert_eq!(parse_timeframe("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_timeframe("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_timeframe("1d").unwrap(), Duration::days(1));
        assert!(parse_timeframe("0m").is_err());
        assert!(parse_timeframe("15x").is_err());
        assert!(parse_timeframe("h").is_err());
        assert!(parse_timeframe("").is_err());
    }

    #[test]
    fn test_multibyte_unit_is_an_error() {
        assert!(parse_timeframe("15µ").is_err());
        assert!(parse_timeframe("µ").is_err());
    }

    #[test]
    fn test_closed_candles_drops_in_progress() {
        let candles = vec![candle_at(0), candle_at(15), candle_at(30)];
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 40, 0).unwrap();

        let closed = closed_candles(candles, Duration::minutes(15), now);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].datetime.format("%M").to_string(), "15");
    }

    #[test]
    fn test_candle_closing_exactly_now_counts() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let closed = closed_candles(vec![candle_at(15)], Duration::minutes(15), now);
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_bar_since_hides_range_before_entry() {
        let view = MarketView::new("15m", vec![candle_at(0), candle_at(15)]);

        // Entered after the 00:15 candle closed: only its close counts
        let entered_late = Utc.with_ymd_and_hms(2024, 1, 1, 0, 31, 0).unwrap();
        let bar = view.bar_since(entered_late).unwrap();
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (100.0, 100.0, 100.0, 100.0));

        // Entered while it was still forming: full range
        let entered_early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 20, 0).unwrap();
        let bar = view.bar_since(entered_early).unwrap();
        assert_eq!((bar.high, bar.low), (101.0, 99.0));
    }

    #[test]
    fn test_empty_view_has_no_price() {
        let view = MarketView::new("15m", vec![]);
        assert!(view.price().unwrap_err().is_data_insufficient());
        assert!(view.last_candle().unwrap_err().is_data_insufficient());
    }
}
