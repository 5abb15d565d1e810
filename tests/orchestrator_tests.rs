//! Orchestrator integration tests
//!
//! Drives full cycles against a scripted exchange double and an in-memory
//! SQLite store. The regime series is built so its ADX is unambiguous:
//! a staircase of higher highs and higher lows reads ~100 (TRENDING), a
//! zig-zag of equal up and down moves reads in the single digits (RANGING).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use regime_trader::exchange::ExchangeClient;
use regime_trader::market::MarketView;
use regime_trader::orchestrator::{ExecutionMode, OrchestratorSettings, PaperAccount};
use regime_trader::regime::RegimeState;
use regime_trader::storage::{SqliteTradeStore, TradeStore};
use regime_trader::strategies::{EntryIntent, ExitIntent, ExitReason, SignalEngine};
use regime_trader::{
    Candle, Config, ExchangePosition, Orchestrator, OrderRequest, OrderResult, Position, Side,
    StrategyId, Symbol, TradeRecord, TradingError, TradingResult,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

/// `count` closed candles ending exactly at `end`
fn candles_ending(end: DateTime<Utc>, step: Duration, closes: &[(f64, f64, f64)]) -> Vec<Candle> {
    let count = closes.len() as i32;
    closes
        .iter()
        .enumerate()
        .map(|(i, &(high, low, close))| Candle {
            datetime: end - step * (count - i as i32),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
        })
        .collect()
}

fn trending_hourly(count: usize) -> Vec<Candle> {
    let bars: Vec<_> = (0..count)
        .map(|i| {
            let c = 100.0 + i as f64;
            (c + 1.0, c - 1.0, c)
        })
        .collect();
    candles_ending(now(), Duration::hours(1), &bars)
}

fn ranging_hourly(count: usize) -> Vec<Candle> {
    let bars: Vec<_> = (0..count)
        .map(|i| {
            let c = if i % 2 == 0 { 100.0 } else { 101.0 };
            (c + 1.0, c - 1.0, c)
        })
        .collect();
    candles_ending(now(), Duration::hours(1), &bars)
}

/// Flat zig-zag around 100 that closes with a collapse to 80
fn oversold_quarter_hours(count: usize) -> Vec<Candle> {
    let mut bars: Vec<_> = (0..count - 1)
        .map(|i| {
            let c = if i % 2 == 0 { 100.5 } else { 99.5 };
            (c + 0.5, c - 0.5, c)
        })
        .collect();
    bars.push((100.0, 79.5, 80.0));
    candles_ending(now(), Duration::minutes(15), &bars)
}

fn flat_quarter_hours(count: usize, price: f64) -> Vec<Candle> {
    let bars: Vec<_> = (0..count).map(|_| (price + 0.5, price - 0.5, price)).collect();
    candles_ending(now(), Duration::minutes(15), &bars)
}

// =============================================================================
// Exchange double
// =============================================================================

#[derive(Default)]
struct MockState {
    candles: HashMap<String, Vec<Candle>>,
    fail_fetch: bool,
    reject_orders: bool,
    fill_price: Option<f64>,
    /// Share of each order that fills; all of it when unset
    fill_fraction: Option<f64>,
    balance: f64,
    orders: Vec<OrderRequest>,
}

#[derive(Default)]
struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        let mock = MockExchange::default();
        mock.state.lock().unwrap().balance = 10_000.0;
        Arc::new(mock)
    }

    fn set_candles(&self, timeframe: &str, candles: Vec<Candle>) {
        self.state.lock().unwrap().candles.insert(timeframe.to_string(), candles);
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn fetch_candles(&self, _symbol: &Symbol, timeframe: &str, _limit: usize) -> TradingResult<Vec<Candle>> {
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(TradingError::TransientNetwork("connection reset".into()));
        }
        Ok(state.candles.get(timeframe).cloned().unwrap_or_default())
    }

    async fn place_order(&self, order: &OrderRequest) -> TradingResult<OrderResult> {
        let mut state = self.state.lock().unwrap();
        if state.reject_orders {
            return Err(TradingError::ExchangeRejection("insufficient balance".into()));
        }
        state.orders.push(order.clone());
        Ok(OrderResult {
            filled_price: state.fill_price.unwrap_or(100.0),
            filled_size: order.size * state.fill_fraction.unwrap_or(1.0),
        })
    }

    async fn get_open_position(&self, _symbol: &Symbol) -> TradingResult<Option<ExchangePosition>> {
        Ok(None)
    }

    async fn free_balance(&self, _asset: &str) -> TradingResult<f64> {
        Ok(self.state.lock().unwrap().balance)
    }
}

// =============================================================================
// Store double: SQLite with switchable write failures
// =============================================================================

struct FlakyStore {
    inner: SqliteTradeStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(FlakyStore {
            inner: SqliteTradeStore::in_memory().unwrap(),
            fail_writes: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> TradingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TradingError::Storage("disk I/O error".into()));
        }
        Ok(())
    }
}

impl TradeStore for FlakyStore {
    fn record_trade(&self, trade: &TradeRecord) -> TradingResult<i64> {
        self.check()?;
        self.inner.record_trade(trade)
    }

    fn closed_trades(&self, strategy: Option<StrategyId>) -> TradingResult<Vec<TradeRecord>> {
        self.inner.closed_trades(strategy)
    }

    fn save_open_position(&self, symbol: &Symbol, position: &Position) -> TradingResult<()> {
        self.check()?;
        self.inner.save_open_position(symbol, position)
    }

    fn remove_open_position(&self, strategy: StrategyId) -> TradingResult<()> {
        self.check()?;
        self.inner.remove_open_position(strategy)
    }

    fn load_open_positions(&self, symbol: &Symbol) -> TradingResult<Vec<Position>> {
        self.inner.load_open_positions(symbol)
    }

    fn load_paper_account(&self) -> TradingResult<Option<PaperAccount>> {
        self.inner.load_paper_account()
    }

    fn save_paper_account(&self, account: &PaperAccount) -> TradingResult<()> {
        self.check()?;
        self.inner.save_paper_account(account)
    }

    fn reset_paper_account(&self, initial_balance: f64) -> TradingResult<PaperAccount> {
        self.check()?;
        self.inner.reset_paper_account(initial_balance)
    }
}

// =============================================================================
// Scripted engine: signals are set by the test, positions are real
// =============================================================================

#[derive(Default)]
struct Script {
    entry: Option<EntryIntent>,
    exit: Option<ExitIntent>,
    entry_calls: usize,
    exit_calls: usize,
}

struct ScriptedEngine {
    id: StrategyId,
    timeframe: &'static str,
    regime: RegimeState,
    position: Option<Position>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    fn boxed(id: StrategyId, timeframe: &'static str, regime: RegimeState) -> (Box<dyn SignalEngine>, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let engine = ScriptedEngine {
            id,
            timeframe,
            regime,
            position: None,
            script: script.clone(),
        };
        (Box::new(engine), script)
    }
}

impl SignalEngine for ScriptedEngine {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn timeframe(&self) -> &str {
        self.timeframe
    }

    fn required_regime(&self) -> RegimeState {
        self.regime
    }

    fn candle_limit(&self) -> usize {
        50
    }

    fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    fn evaluate_entry(&self, _view: &MarketView) -> TradingResult<Option<EntryIntent>> {
        let mut script = self.script.lock().unwrap();
        script.entry_calls += 1;
        Ok(script.entry.clone())
    }

    fn evaluate_exit(&self, _view: &MarketView) -> TradingResult<Option<ExitIntent>> {
        let mut script = self.script.lock().unwrap();
        script.exit_calls += 1;
        Ok(script.exit.clone())
    }

    fn open_position(&mut self, intent: &EntryIntent, fill: &OrderResult, now: DateTime<Utc>) -> &Position {
        self.position.insert(Position {
            strategy: self.id,
            side: intent.side,
            entry_price: fill.filled_price,
            size: fill.filled_size,
            entry_time: now,
            stop_level: intent.stop_level,
            target_level: intent.target_level,
        })
    }

    fn close_position(&mut self) -> Option<Position> {
        self.position.take()
    }

    fn restore_position(&mut self, position: Position) {
        self.position = Some(position);
    }
}

fn long_entry(id: StrategyId, price: f64) -> EntryIntent {
    EntryIntent {
        strategy: id,
        side: Side::Long,
        reference_price: price,
        stop_level: price - 5.0,
        target_level: Some(price + 5.0),
        reason: "scripted".into(),
    }
}

fn take_profit(id: StrategyId, price: f64) -> ExitIntent {
    ExitIntent {
        strategy: id,
        reason: ExitReason::TakeProfit,
        reference_price: price,
        detail: "scripted".into(),
    }
}

struct Harness {
    orchestrator: Orchestrator,
    exchange: Arc<MockExchange>,
    store: Arc<FlakyStore>,
    mr: Arc<Mutex<Script>>,
    ts: Arc<Mutex<Script>>,
}

/// Orchestrator with both scripted engines over any store
fn scripted(
    mode: ExecutionMode,
    exchange: Arc<MockExchange>,
    store: Arc<dyn TradeStore>,
) -> (Orchestrator, Arc<Mutex<Script>>, Arc<Mutex<Script>>) {
    let mut settings = OrchestratorSettings::from_config(&Config::default());
    settings.mode = mode;

    let (mr_engine, mr) = ScriptedEngine::boxed(StrategyId::MeanReversion, "15m", RegimeState::Ranging);
    let (ts_engine, ts) = ScriptedEngine::boxed(StrategyId::TrendSniper, "1h", RegimeState::Trending);

    let orchestrator = Orchestrator::with_engines(settings, exchange, store, vec![mr_engine, ts_engine]);
    (orchestrator, mr, ts)
}

fn harness(mode: ExecutionMode, hourly: Vec<Candle>) -> Harness {
    let exchange = MockExchange::new();
    exchange.set_candles("1h", hourly);
    exchange.set_candles("15m", flat_quarter_hours(60, 100.0));
    let store = FlakyStore::new();

    let (orchestrator, mr, ts) = scripted(mode, exchange.clone(), store.clone());

    Harness {
        orchestrator,
        exchange,
        store,
        mr,
        ts,
    }
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_seed_from_trending_series() {
    let mut h = harness(ExecutionMode::DryRun, trending_hourly(100));
    h.orchestrator.initialize(now()).await.unwrap();

    let snap = h.orchestrator.regime().unwrap();
    assert_eq!(snap.current, RegimeState::Trending);
    assert!(snap.last_adx > 25.0);
    assert!(snap.last_change_at.is_none());
}

#[tokio::test]
async fn test_seed_from_ranging_series() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.orchestrator.initialize(now()).await.unwrap();

    let snap = h.orchestrator.regime().unwrap();
    assert_eq!(snap.current, RegimeState::Ranging);
    assert!(snap.last_adx < 20.0);
}

#[tokio::test]
async fn test_too_little_history_fails_seeding() {
    let mut h = harness(ExecutionMode::DryRun, trending_hourly(10));
    let err = h.orchestrator.initialize(now()).await.unwrap_err();
    assert!(err.is_data_insufficient());
    assert!(h.orchestrator.regime().is_none());
}

#[tokio::test]
async fn test_restores_persisted_position() {
    let h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    let symbol = Symbol::new("BTC/USDT");
    let saved = Position {
        strategy: StrategyId::TrendSniper,
        side: Side::Short,
        entry_price: 101.0,
        size: 0.5,
        entry_time: now() - Duration::hours(3),
        stop_level: 104.0,
        target_level: None,
    };
    h.store.save_open_position(&symbol, &saved).unwrap();

    let mut orchestrator = h.orchestrator;
    orchestrator.initialize(now()).await.unwrap();

    assert_eq!(orchestrator.position(StrategyId::TrendSniper), Some(&saved));
    assert!(orchestrator.position(StrategyId::MeanReversion).is_none());
}

// =============================================================================
// Gating
// =============================================================================

#[tokio::test]
async fn test_only_the_matching_strategy_evaluates_entries() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));

    let report = h.orchestrator.run_cycle_at(now()).await.unwrap();

    assert_eq!(report.regime, Some(RegimeState::Ranging));
    assert_eq!(report.entries_evaluated, vec![StrategyId::MeanReversion]);
    assert_eq!(h.mr.lock().unwrap().entry_calls, 1);
    assert_eq!(h.ts.lock().unwrap().entry_calls, 0);
}

#[tokio::test]
async fn test_regime_flip_blocks_entries_for_cooldown() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.orchestrator.run_cycle_at(now()).await.unwrap();

    h.exchange.set_candles("1h", trending_hourly(100));
    h.ts.lock().unwrap().entry = Some(long_entry(StrategyId::TrendSniper, 199.0));

    let flip = h.orchestrator.run_cycle_at(now()).await.unwrap();
    let change = flip.regime_change.expect("regime should flip");
    assert_eq!(change.old, RegimeState::Ranging);
    assert_eq!(change.new, RegimeState::Trending);
    assert!(flip.cooling_down);
    assert!(flip.entries_evaluated.is_empty());

    let still_cooling = h.orchestrator.run_cycle_at(now() + Duration::minutes(14)).await.unwrap();
    assert!(still_cooling.cooling_down);
    assert!(still_cooling.opened.is_empty());

    let after = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();
    assert!(!after.cooling_down);
    assert!(after.regime_change.is_none());
    assert_eq!(after.entries_evaluated, vec![StrategyId::TrendSniper]);
    assert_eq!(after.opened, vec![StrategyId::TrendSniper]);
}

#[tokio::test]
async fn test_position_keeps_exit_management_after_regime_flip() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));

    let open = h.orchestrator.run_cycle_at(now()).await.unwrap();
    assert_eq!(open.opened, vec![StrategyId::MeanReversion]);
    h.mr.lock().unwrap().entry = None;

    // Trend takes over: no new MR entries, but the open MR position is still watched
    h.exchange.set_candles("1h", trending_hourly(100));
    let flip = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();
    assert_eq!(flip.regime, Some(RegimeState::Trending));
    assert_eq!(flip.exits_evaluated, vec![StrategyId::MeanReversion]);
    assert!(!flip.entries_evaluated.contains(&StrategyId::MeanReversion));
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_some());

    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 104.0));
    let close = h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();

    assert_eq!(close.closed.len(), 1);
    assert_eq!(close.closed[0].exit_reason, "TAKE_PROFIT");
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_none());
    assert_eq!(h.mr.lock().unwrap().entry_calls, 1);

    let trades = h.store.closed_trades(Some(StrategyId::MeanReversion)).unwrap();
    assert_eq!(trades.len(), 1);
    assert!(trades[0].pnl_absolute > 0.0);
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_fetch_failure_leaves_state_untouched() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    let position_before = h.orchestrator.position(StrategyId::MeanReversion).cloned();
    let regime_before = h.orchestrator.regime();

    h.exchange.with(|s| s.fail_fetch = true);
    h.exchange.set_candles("1h", trending_hourly(100));
    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 104.0));
    let exits_before = h.mr.lock().unwrap().exit_calls;

    let err = h.orchestrator.run_cycle_at(now() + Duration::hours(1)).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(h.orchestrator.regime(), regime_before);
    assert_eq!(h.orchestrator.position(StrategyId::MeanReversion).cloned(), position_before);
    assert_eq!(h.mr.lock().unwrap().exit_calls, exits_before);
    assert!(h.store.closed_trades(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_exit_keeps_position() {
    let mut h = harness(ExecutionMode::Live, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_some());

    h.exchange.with(|s| s.reject_orders = true);
    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 104.0));
    let report = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    assert!(report.closed.is_empty());
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].0, StrategyId::MeanReversion);
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_some());
    assert!(h.store.closed_trades(None).unwrap().is_empty());

    // Next cycle tries again and succeeds
    h.exchange.with(|s| {
        s.reject_orders = false;
        s.fill_price = Some(104.0);
    });
    let retry = h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();
    assert_eq!(retry.closed.len(), 1);
    assert_eq!(retry.closed[0].exit_price, 104.0);
}

#[tokio::test]
async fn test_rejected_entry_is_abandoned() {
    let mut h = harness(ExecutionMode::Live, ranging_hourly(100));
    h.exchange.with(|s| s.reject_orders = true);
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));

    let report = h.orchestrator.run_cycle_at(now()).await.unwrap();

    assert!(report.opened.is_empty());
    assert_eq!(report.abandoned.len(), 1);
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_none());
}

#[tokio::test]
async fn test_storage_failure_queues_trade_for_replay() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    h.store.set_failing(true);
    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 103.0));
    let report = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.pending_trades, 1);
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_none());
    assert!(h.store.closed_trades(None).unwrap().is_empty());

    h.store.set_failing(false);
    let replay = h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();

    assert_eq!(replay.pending_trades, 0);
    let trades = h.store.closed_trades(None).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_price, 103.0);
    assert!(h
        .store
        .load_open_positions(&Symbol::new("BTC/USDT"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_paper_account_save_is_retried() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    h.store.set_failing(true);
    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 102.0));
    h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();
    let stored = h.store.load_paper_account().unwrap().unwrap();
    assert_eq!(stored.balance(), 10_000.0);
    assert!(stored.is_reserved(StrategyId::MeanReversion));

    h.store.set_failing(false);
    h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();
    let stored = h.store.load_paper_account().unwrap().unwrap();
    assert!((stored.balance() - 10_010.0).abs() < 1e-9);
    assert_eq!(stored.margin_used(), 0.0);
}

// =============================================================================
// Execution
// =============================================================================

#[tokio::test]
async fn test_dry_run_never_touches_the_exchange_order_path() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    let position = h.orchestrator.position(StrategyId::MeanReversion).cloned().unwrap();
    assert_eq!(position.entry_price, 100.0);
    // 5% of the 10k paper balance at 100
    assert!((position.size - 5.0).abs() < 1e-9);

    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 110.0));
    h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    assert!(h.exchange.with(|s| s.orders.is_empty()));
    assert!((h.orchestrator.paper_account().balance() - 10_050.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_paper_margin_limits_the_next_entry() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    let paper = h.orchestrator.paper_account();
    assert_eq!(paper.balance(), 10_000.0);
    assert!((paper.margin_used() - 500.0).abs() < 1e-9);
    assert!((paper.available() - 9_500.0).abs() < 1e-9);

    // Trend entry after the flip and its cooldown sizes off what is left
    h.exchange.set_candles("1h", trending_hourly(100));
    h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();
    h.ts.lock().unwrap().entry = Some(long_entry(StrategyId::TrendSniper, 200.0));
    let report = h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();

    assert_eq!(report.opened, vec![StrategyId::TrendSniper]);
    let trend = h.orchestrator.position(StrategyId::TrendSniper).unwrap();
    // 5% of 9500 at 200
    assert!((trend.size - 2.375).abs() < 1e-9);
    assert!((h.orchestrator.paper_account().margin_used() - 975.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_paper_balance_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("trades.db");
    let exchange = MockExchange::new();
    exchange.set_candles("1h", ranging_hourly(100));
    exchange.set_candles("15m", flat_quarter_hours(60, 100.0));

    {
        let store = Arc::new(SqliteTradeStore::open(&db_path).unwrap());
        let (mut orchestrator, mr, _ts) = scripted(ExecutionMode::DryRun, exchange.clone(), store);
        mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
        orchestrator.run_cycle_at(now()).await.unwrap();
        mr.lock().unwrap().entry = None;
        mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 110.0));
        orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();
        assert!((orchestrator.paper_account().balance() - 10_050.0).abs() < 1e-9);
    }

    let store = Arc::new(SqliteTradeStore::open(&db_path).unwrap());
    let (mut restarted, _mr, _ts) = scripted(ExecutionMode::DryRun, exchange, store);
    restarted.initialize(now() + Duration::hours(1)).await.unwrap();

    let paper = restarted.paper_account();
    assert!((paper.balance() - 10_050.0).abs() < 1e-9);
    assert_eq!(paper.initial_balance(), 10_000.0);
    assert!((paper.pnl_percent() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_restart_rebuilds_paper_margin_from_positions() {
    let h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    let symbol = Symbol::new("BTC/USDT");
    h.store
        .save_open_position(
            &symbol,
            &Position {
                strategy: StrategyId::MeanReversion,
                side: Side::Long,
                entry_price: 100.0,
                size: 3.0,
                entry_time: now() - Duration::hours(1),
                stop_level: 95.0,
                target_level: Some(105.0),
            },
        )
        .unwrap();
    // Margin left behind by a trend position that no longer exists
    let mut stale = PaperAccount::new(8_000.0);
    stale.reserve(StrategyId::TrendSniper, 400.0);
    h.store.save_paper_account(&stale).unwrap();

    let mut orchestrator = h.orchestrator;
    orchestrator.initialize(now()).await.unwrap();

    let paper = orchestrator.paper_account();
    assert_eq!(paper.balance(), 8_000.0);
    assert!(!paper.is_reserved(StrategyId::TrendSniper));
    assert!((paper.margin_used() - 300.0).abs() < 1e-9);
    assert_eq!(h.store.load_paper_account().unwrap().as_ref(), Some(paper));
}

#[tokio::test]
async fn test_partial_exit_keeps_the_rest_open() {
    let mut h = harness(ExecutionMode::Live, ranging_hourly(100));
    let symbol = Symbol::new("BTC/USDT");
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    h.exchange.with(|s| {
        s.fill_price = Some(104.0);
        s.fill_fraction = Some(0.4);
    });
    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 104.0));
    let partial = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    let exit_order = h.exchange.with(|s| s.orders.last().cloned()).unwrap();
    assert!(exit_order.reduce_only);
    assert!((exit_order.size - 5.0).abs() < 1e-9);

    assert_eq!(partial.closed.len(), 1);
    assert!((partial.closed[0].size - 2.0).abs() < 1e-9);
    assert!((partial.closed[0].pnl_absolute - 8.0).abs() < 1e-9);
    let rest = h.orchestrator.position(StrategyId::MeanReversion).unwrap();
    assert!((rest.size - 3.0).abs() < 1e-9);
    assert_eq!(rest.entry_price, 100.0);
    let persisted = h.store.load_open_positions(&symbol).unwrap();
    assert!((persisted[0].size - 3.0).abs() < 1e-9);

    // The remainder goes out on the next cycle
    h.exchange.with(|s| s.fill_fraction = None);
    let full = h.orchestrator.run_cycle_at(now() + Duration::minutes(30)).await.unwrap();

    let exit_order = h.exchange.with(|s| s.orders.last().cloned()).unwrap();
    assert!((exit_order.size - 3.0).abs() < 1e-9);
    assert!((full.closed[0].size - 3.0).abs() < 1e-9);
    assert!(h.orchestrator.position(StrategyId::MeanReversion).is_none());
    assert!(h.store.load_open_positions(&symbol).unwrap().is_empty());
    assert_eq!(h.store.closed_trades(None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cycle_reports_unrealized_pnl() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    let opened = h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;
    // Opened after the exit phase, so nothing was held yet
    assert_eq!(opened.unrealized_pnl, 0.0);

    h.exchange.set_candles("15m", flat_quarter_hours(60, 102.0));
    let held = h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    // 5 units bought at 100, last close 102
    assert!((held.unrealized_pnl - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_live_sizing_uses_free_balance() {
    let mut h = harness(ExecutionMode::Live, ranging_hourly(100));
    h.exchange.with(|s| s.balance = 2_000.0);
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));

    h.orchestrator.run_cycle_at(now()).await.unwrap();

    let orders = h.exchange.with(|s| s.orders.clone());
    assert_eq!(orders.len(), 1);
    assert!((orders[0].size - 1.0).abs() < 1e-9);
    assert_eq!(orders[0].symbol, Symbol::new("BTC/USDT"));
}

#[tokio::test]
async fn test_entry_below_minimum_size_is_skipped() {
    let mut h = harness(ExecutionMode::Live, ranging_hourly(100));
    h.exchange.with(|s| s.balance = 0.0001);
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));

    let report = h.orchestrator.run_cycle_at(now()).await.unwrap();

    assert!(report.opened.is_empty());
    assert!(h.exchange.with(|s| s.orders.is_empty()));
}

#[tokio::test]
async fn test_open_position_is_persisted_and_cleared() {
    let mut h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    let symbol = Symbol::new("BTC/USDT");
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    h.orchestrator.run_cycle_at(now()).await.unwrap();
    h.mr.lock().unwrap().entry = None;

    assert_eq!(h.store.load_open_positions(&symbol).unwrap().len(), 1);

    h.mr.lock().unwrap().exit = Some(take_profit(StrategyId::MeanReversion, 101.0));
    h.orchestrator.run_cycle_at(now() + Duration::minutes(15)).await.unwrap();

    assert!(h.store.load_open_positions(&symbol).unwrap().is_empty());
}

// =============================================================================
// Real engines end to end
// =============================================================================

#[tokio::test]
async fn test_mean_reversion_enters_on_oversold_collapse() {
    let exchange = MockExchange::new();
    exchange.set_candles("1h", ranging_hourly(300));
    exchange.set_candles("15m", oversold_quarter_hours(300));
    let store = Arc::new(SqliteTradeStore::in_memory().unwrap());

    let config = Config::default();
    let mut orchestrator = Orchestrator::new(&config, exchange.clone(), store).unwrap();

    let report = orchestrator.run_cycle_at(now()).await.unwrap();

    assert_eq!(report.regime, Some(RegimeState::Ranging));
    assert_eq!(report.opened, vec![StrategyId::MeanReversion]);
    let position = orchestrator.position(StrategyId::MeanReversion).unwrap();
    assert_eq!(position.side, Side::Long);
    assert_eq!(position.entry_price, 80.0);
    assert!(position.stop_level < 80.0);
    assert!(position.target_level.unwrap() > 80.0);
    assert!(orchestrator.position(StrategyId::TrendSniper).is_none());
}

#[tokio::test]
async fn test_run_stops_on_cancellation() {
    let h = harness(ExecutionMode::DryRun, ranging_hourly(100));
    let mut orchestrator = h.orchestrator;
    let token = CancellationToken::new();
    token.cancel();

    let result = tokio::time::timeout(StdDuration::from_secs(5), orchestrator.run(token)).await;

    assert!(matches!(result, Ok(Ok(()))));
}

#[tokio::test]
async fn test_cancelled_mid_run_issues_no_orders() {
    let h = harness(ExecutionMode::Live, ranging_hourly(100));
    h.mr.lock().unwrap().entry = Some(long_entry(StrategyId::MeanReversion, 100.0));
    let exchange = h.exchange.clone();
    let mut orchestrator = h.orchestrator;

    let token = CancellationToken::new();
    let stopper = token.clone();
    let handle = tokio::spawn(async move {
        orchestrator.run(token).await.unwrap();
        orchestrator
    });

    tokio::time::sleep(StdDuration::from_millis(200)).await;
    stopper.cancel();
    let orchestrator = tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    // First tick fires immediately, so exactly one cycle opened the position
    assert_eq!(exchange.with(|s| s.orders.len()), 1);
    assert!(orchestrator.position(StrategyId::MeanReversion).is_some());
}
