//! Strategy engines driven through the SignalEngine interface with candle
//! series, the way the orchestrator calls them.

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};

use regime_trader::market::MarketView;
use regime_trader::strategies::{
    ExitReason, MeanReversionConfig, MeanReversionStrategy, SignalEngine, TrendSniperConfig,
    TrendSniperStrategy,
};
use regime_trader::{Candle, OrderResult, Position, Side, StrategyId};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn series(step: Duration, bars: &[(f64, f64, f64)]) -> Vec<Candle> {
    bars.iter()
        .enumerate()
        .map(|(i, &(high, low, close))| Candle {
            datetime: start() + step * i as i32,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        })
        .collect()
}

/// Slow grind up: close 100 + 0.1 * i, one-point range
fn grind_up(count: usize) -> Vec<(f64, f64, f64)> {
    (0..count)
        .map(|i| {
            let c = 100.0 + 0.1 * i as f64;
            (c + 0.5, c - 0.5, c)
        })
        .collect()
}

/// Append one candle with an explicit open after the last one
fn push_bar(candles: &mut Vec<Candle>, step: Duration, open: f64, high: f64, low: f64, close: f64) {
    let datetime = candles.last().map(|c| c.datetime + step).unwrap_or_else(start);
    candles.push(Candle::new(datetime, open, high, low, close, 1.0).unwrap());
}

/// 30 quarter-hour candles zig-zagging 100.5 / 99.5
fn zigzag_quarter_hours() -> Vec<Candle> {
    let bars: Vec<_> = (0..30)
        .map(|i| {
            let c = if i % 2 == 0 { 100.5 } else { 99.5 };
            (c + 0.5, c - 0.5, c)
        })
        .collect();
    series(Duration::minutes(15), &bars)
}

/// MR long held from 99.0 with its stop at 95
fn mean_reversion_long() -> MeanReversionStrategy {
    let mut engine = MeanReversionStrategy::new(MeanReversionConfig::default());
    engine.restore_position(Position {
        strategy: StrategyId::MeanReversion,
        side: Side::Long,
        entry_price: 99.0,
        size: 1.0,
        entry_time: start(),
        stop_level: 95.0,
        target_level: Some(100.0),
    });
    engine
}

/// Close time of the latest candle, when a cycle would act on it
fn closed_at(view: &MarketView, step: Duration) -> DateTime<Utc> {
    view.candles.last().unwrap().datetime + step
}

fn fill(price: f64, size: f64) -> OrderResult {
    OrderResult {
        filled_price: price,
        filled_size: size,
    }
}

#[test]
fn test_trend_sniper_breakout_and_trailing() {
    let mut bars = grind_up(249);
    // 124.8 is the last grind close; breakout candle closes at 129.9
    bars.push((130.4, 124.4, 129.9));
    let view = MarketView::new("1h", series(Duration::hours(1), &bars));

    let mut engine = TrendSniperStrategy::new(TrendSniperConfig::default());
    let intent = engine.evaluate_entry(&view).unwrap().expect("breakout above channel");

    assert_eq!(intent.side, Side::Long);
    assert_relative_eq!(intent.reference_price, 129.9);
    // Lowest low of the 20 candles ending with the breakout: candle 230
    assert_relative_eq!(intent.stop_level, 122.5, epsilon = 1e-9);
    assert!(intent.target_level.is_none());

    engine.open_position(&intent, &fill(129.9, 0.1), closed_at(&view, Duration::hours(1)));
    assert!(engine.evaluate_exit(&view).unwrap().is_none());

    // Five more rising candles push the channel floor up to candle 235
    for j in 0..5 {
        let c = 130.0 + j as f64;
        bars.push((c + 0.5, c - 0.5, c));
    }
    let later = MarketView::new("1h", series(Duration::hours(1), &bars));

    let moved = engine.manage_stop(&later).unwrap();
    assert_relative_eq!(moved.unwrap(), 123.0, epsilon = 1e-9);
    assert_relative_eq!(engine.position().unwrap().stop_level, 123.0, epsilon = 1e-9);

    // Same data again: the stop is already there, nothing moves
    assert!(engine.manage_stop(&later).unwrap().is_none());
}

#[test]
fn test_trend_sniper_stop_exit() {
    let mut bars = grind_up(249);
    bars.push((130.4, 124.4, 129.9));
    let mut engine = TrendSniperStrategy::new(TrendSniperConfig::default());
    let view = MarketView::new("1h", series(Duration::hours(1), &bars));
    let intent = engine.evaluate_entry(&view).unwrap().unwrap();
    engine.open_position(&intent, &fill(129.9, 0.1), closed_at(&view, Duration::hours(1)));

    // Wick through the 122.5 stop, close back above it
    let mut wick = series(Duration::hours(1), &bars);
    push_bar(&mut wick, Duration::hours(1), 126.0, 127.0, 122.0, 126.0);
    let exit = engine
        .evaluate_exit(&MarketView::new("1h", wick))
        .unwrap()
        .expect("low crossed the stop");
    assert_eq!(exit.reason, ExitReason::StopLoss);
    assert_relative_eq!(exit.reference_price, 122.5);

    // Opened below the stop: the gap fills at the open
    bars.push((123.0, 121.0, 122.0));
    let crash = MarketView::new("1h", series(Duration::hours(1), &bars));
    let exit = engine.evaluate_exit(&crash).unwrap().expect("gap below stop");

    assert_eq!(exit.reason, ExitReason::StopLoss);
    assert_relative_eq!(exit.reference_price, 122.0);
}

#[test]
fn test_mean_reversion_round_trip_to_the_mean() {
    let mut bars: Vec<_> = (0..99)
        .map(|i| {
            let c = if i % 2 == 0 { 100.5 } else { 99.5 };
            (c + 0.5, c - 0.5, c)
        })
        .collect();
    bars.push((100.0, 79.5, 80.0));
    let view = MarketView::new("15m", series(Duration::minutes(15), &bars));

    let mut engine = MeanReversionStrategy::new(MeanReversionConfig::default());
    let intent = engine.evaluate_entry(&view).unwrap().expect("oversold collapse");
    assert_eq!(intent.side, Side::Long);
    let target = intent.target_level.unwrap();
    assert!(target > 95.0 && target < 100.5);

    // The collapse candle's 100 high came before the fill at 80
    engine.open_position(&intent, &fill(80.0, 1.0), closed_at(&view, Duration::minutes(15)));
    assert!(engine.evaluate_exit(&view).unwrap().is_none());

    // Snap back above the 20-period mean
    bars.push((101.0, 99.0, 100.5));
    let recovered = MarketView::new("15m", series(Duration::minutes(15), &bars));
    let exit = engine.evaluate_exit(&recovered).unwrap().expect("back at the mean");

    assert_eq!(exit.reason, ExitReason::TakeProfit);
    assert_relative_eq!(exit.reference_price, 100.5);
}

// =============================================================================
// Intrabar exits
// =============================================================================

#[test]
fn test_mean_reversion_stop_touched_intrabar() {
    let engine = mean_reversion_long();
    let mut candles = zigzag_quarter_hours();
    // SMA20 ends near 99.97, above this candle's high; the low spikes through 95
    push_bar(&mut candles, Duration::minutes(15), 99.8, 99.9, 90.0, 99.8);

    let exit = engine
        .evaluate_exit(&MarketView::new("15m", candles))
        .unwrap()
        .expect("stop crossed intrabar");

    assert_eq!(exit.reason, ExitReason::StopLoss);
    assert_relative_eq!(exit.reference_price, 95.0);
}

#[test]
fn test_mean_reversion_target_touched_intrabar() {
    let engine = mean_reversion_long();
    let mut candles = zigzag_quarter_hours();
    // Closes below the mean but the high reaches it
    push_bar(&mut candles, Duration::minutes(15), 99.0, 100.2, 98.8, 99.0);

    let exit = engine
        .evaluate_exit(&MarketView::new("15m", candles))
        .unwrap()
        .expect("high reached the mean");

    assert_eq!(exit.reason, ExitReason::TakeProfit);
    // (10 x 99.5 + 9 x 100.5 + 99.0) / 20
    assert_relative_eq!(exit.reference_price, 99.925, epsilon = 1e-9);
}

#[test]
fn test_mean_reversion_candle_through_both_levels_exits_on_stop() {
    let engine = mean_reversion_long();
    let mut candles = zigzag_quarter_hours();
    push_bar(&mut candles, Duration::minutes(15), 100.0, 101.0, 90.0, 100.0);

    let exit = engine
        .evaluate_exit(&MarketView::new("15m", candles))
        .unwrap()
        .expect("both levels reached");

    assert_eq!(exit.reason, ExitReason::StopLoss);
    assert_relative_eq!(exit.reference_price, 95.0);
}

#[test]
fn test_mean_reversion_quiet_candle_holds() {
    let engine = mean_reversion_long();
    let mut candles = zigzag_quarter_hours();
    push_bar(&mut candles, Duration::minutes(15), 99.0, 99.5, 98.5, 99.2);

    assert!(engine.evaluate_exit(&MarketView::new("15m", candles)).unwrap().is_none());
}
