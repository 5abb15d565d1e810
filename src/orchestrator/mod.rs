//! Orchestrator: the single control loop
//!
//! Cycle order:
//! 1. Fetch candles for every timeframe in use. Nothing is decided until all
//!    fetches have succeeded, so a network failure leaves all state untouched.
//! 2. Feed the latest closed-candle ADX to the regime detector.
//! 3. Exit checks for every engine holding a position, active or not.
//! 4. Entry checks, only for engines the activation gate lets through.
//! 5. Replay trade records, position deletes and paper account saves that
//!    failed to persist earlier.
//!
//! The cancellation token is checked at the top of every cycle and before
//! every exchange call, so shutdown never leaves an order half-issued.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

pub mod gate;

pub use crate::paper::{ExecutionMode, PaperAccount};
pub use gate::is_active;

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeClient;
use crate::indicators::{adx, adx_warmup, latest, PriceColumns};
use crate::market::{closed_candles, parse_timeframe, MarketView};
use crate::regime::{CooldownTimer, RegimeChangeEvent, RegimeDetector, RegimeSnapshot, RegimeState, RegimeThresholds};
use crate::storage::TradeStore;
use crate::strategies::{
    EntryIntent, ExitIntent, MeanReversionStrategy, SignalEngine, TrendSniperStrategy,
};
use crate::types::{OrderRequest, OrderResult, Position, StrategyId, Symbol, TradeRecord};

/// Fill shortfall below which an exit counts as complete
const PARTIAL_FILL_TOLERANCE: f64 = 1e-9;

/// Settings the loop needs, extracted from [`Config`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub symbol: Symbol,
    pub quote_asset: String,
    pub regime_timeframe: String,
    pub regime_candle_limit: usize,
    pub adx_period: usize,
    pub thresholds: RegimeThresholds,
    pub cooldown: chrono::Duration,
    pub position_size_percent: f64,
    pub min_order_size: f64,
    pub loop_interval: Duration,
    pub failure_backoff: RetryPolicy,
    pub mode: ExecutionMode,
    pub simulated_balance: f64,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        OrchestratorSettings {
            symbol: config.trading.symbol(),
            quote_asset: config.trading.quote_asset().to_string(),
            regime_timeframe: config.regime.timeframe.clone(),
            regime_candle_limit: config.regime.candle_limit,
            adx_period: config.regime.adx_period,
            thresholds: config.regime.thresholds(),
            cooldown: config.regime.cooldown(),
            position_size_percent: config.trading.position_size_percent,
            min_order_size: config.trading.min_order_size,
            loop_interval: Duration::from_secs(config.trading.loop_interval_seconds),
            failure_backoff: config.trading.failure_backoff.clone(),
            mode: ExecutionMode::from_dry_run(config.trading.dry_run),
            simulated_balance: config.trading.simulated_balance,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub regime: Option<RegimeState>,
    pub regime_change: Option<RegimeChangeEvent>,
    pub cooling_down: bool,
    /// Engines whose exit path ran
    pub exits_evaluated: Vec<StrategyId>,
    /// Engines the gate let evaluate entries
    pub entries_evaluated: Vec<StrategyId>,
    pub opened: Vec<StrategyId>,
    /// Closed trades, including the filled part of a partial exit
    pub closed: Vec<TradeRecord>,
    pub stops_moved: Vec<(StrategyId, f64)>,
    /// Open PnL of positions still held after the exit phase, at the latest close
    pub unrealized_pnl: f64,
    /// Intents dropped this cycle, with the reason
    pub abandoned: Vec<(StrategyId, String)>,
    /// Cycle stopped early on shutdown
    pub cancelled: bool,
    pub pending_trades: usize,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    engines: BTreeMap<StrategyId, Box<dyn SignalEngine>>,
    detector: Option<RegimeDetector>,
    cooldown: CooldownTimer,
    paper: PaperAccount,
    pending_trades: VecDeque<TradeRecord>,
    /// Closed positions whose persisted row could not be deleted yet
    stale_positions: BTreeSet<StrategyId>,
    /// Paper account changed but the last save failed
    paper_dirty: bool,
    shutdown: CancellationToken,
    cycle: u64,
}

impl Orchestrator {
    /// Build from a validated configuration with both engines
    pub fn new(config: &Config, exchange: Arc<dyn ExchangeClient>, store: Arc<dyn TradeStore>) -> TradingResult<Self> {
        config.validate()?;

        let engines: Vec<Box<dyn SignalEngine>> = vec![
            Box::new(MeanReversionStrategy::new(config.mean_reversion.clone())),
            Box::new(TrendSniperStrategy::new(config.trend_sniper.clone())),
        ];
        Ok(Self::with_engines(
            OrchestratorSettings::from_config(config),
            exchange,
            store,
            engines,
        ))
    }

    pub fn with_engines(
        settings: OrchestratorSettings,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        engines: Vec<Box<dyn SignalEngine>>,
    ) -> Self {
        Orchestrator {
            cooldown: CooldownTimer::new(settings.cooldown),
            paper: PaperAccount::new(settings.simulated_balance),
            settings,
            exchange,
            store,
            engines: engines.into_iter().map(|e| (e.id(), e)).collect(),
            detector: None,
            pending_trades: VecDeque::new(),
            stale_positions: BTreeSet::new(),
            paper_dirty: false,
            shutdown: CancellationToken::new(),
            cycle: 0,
        }
    }

    // =========================================================================
    // Read-only accessors
    // =========================================================================

    pub fn regime(&self) -> Option<RegimeSnapshot> {
        self.detector.as_ref().map(|d| d.snapshot())
    }

    pub fn position(&self, id: StrategyId) -> Option<&Position> {
        self.engines.get(&id).and_then(|e| e.position())
    }

    pub fn pending_trades(&self) -> usize {
        self.pending_trades.len()
    }

    pub fn paper_account(&self) -> &PaperAccount {
        &self.paper
    }

    pub fn mode(&self) -> ExecutionMode {
        self.settings.mode
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Seed the regime detector from the latest closed ADX, restore persisted
    /// positions and, in dry-run, the paper account. Safe to call again after
    /// a failure.
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> TradingResult<()> {
        let view = self
            .fetch_view(&self.settings.regime_timeframe, self.settings.regime_candle_limit, now)
            .await?;
        let adx_value = self.latest_adx(&view)?;
        let detector = RegimeDetector::seed(self.settings.thresholds, adx_value)?;

        let restored = self.store.load_open_positions(&self.settings.symbol)?;
        let exchange_position = self.exchange.get_open_position(&self.settings.symbol).await?;
        let paper = match self.settings.mode {
            ExecutionMode::DryRun => self.store.load_paper_account()?,
            ExecutionMode::Live => None,
        };

        for position in restored {
            match self.engines.get_mut(&position.strategy) {
                Some(engine) if !engine.has_position() => {
                    info!(
                        "Restored {} position: {} {:.6} @ {:.2}, stop {:.2}",
                        position.strategy, position.side, position.size, position.entry_price, position.stop_level
                    );
                    engine.restore_position(position);
                }
                _ => warn!("Ignoring persisted position for {}", position.strategy),
            }
        }

        if self.exchange.reports_positions() {
            let held = exchange_position.as_ref().map_or(0.0, |p| p.signed_size());
            let local: f64 = self
                .engines
                .values()
                .filter_map(|e| e.position())
                .map(|p| p.signed_size())
                .sum();
            if (local - held).abs() > 1e-9 * held.abs().max(local.abs()).max(1.0) {
                warn!(
                    "Exchange holds {:+.6} {} net but tracked positions net {:+.6}; not adopting untracked size",
                    held, self.settings.symbol, local
                );
            }
        }

        if self.settings.mode.is_dry_run() {
            self.restore_paper_account(paper);
        }

        self.detector = Some(detector);
        Ok(())
    }

    /// Adopt the persisted paper account and line its margin up with the
    /// restored positions
    fn restore_paper_account(&mut self, persisted: Option<PaperAccount>) {
        let mut account = match persisted {
            Some(account) => {
                info!(
                    "Paper account restored: balance {:.2} ({:+.2}%), margin {:.2}",
                    account.balance(),
                    account.pnl_percent(),
                    account.margin_used()
                );
                account
            }
            None => {
                info!("New paper account with {:.2}", self.settings.simulated_balance);
                PaperAccount::new(self.settings.simulated_balance)
            }
        };

        let orphaned: Vec<StrategyId> = account
            .reservations()
            .keys()
            .copied()
            .filter(|id| self.position(*id).is_none())
            .collect();
        for id in orphaned {
            if let Some(margin) = account.release(id) {
                warn!("Released {:.2} paper margin of {} with no open position", margin, id);
            }
        }
        for position in self.engines.values().filter_map(|e| e.position()) {
            if !account.is_reserved(position.strategy) {
                account.reserve(position.strategy, position.entry_price * position.size);
            }
        }

        self.paper = account;
        self.save_paper_account();
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Poll until `shutdown` fires. Open positions are left in place and stay
    /// persisted for the next start.
    pub async fn run(&mut self, shutdown: CancellationToken) -> TradingResult<()> {
        self.shutdown = shutdown.clone();
        let mut ticker = interval(self.settings.loop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = self.settings.failure_backoff.backoff();

        info!(
            "Starting {} loop for {} every {}s",
            self.settings.mode,
            self.settings.symbol,
            self.settings.loop_interval.as_secs()
        );

        'outer: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                if shutdown.is_cancelled() {
                    break 'outer;
                }

                match self.run_cycle_at(Utc::now()).await {
                    Ok(_) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) if e.is_transient() => match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                "Cycle failed ({}), retry {} in {}ms",
                                e,
                                backoff.attempts(),
                                delay.as_millis()
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => break 'outer,
                                _ = sleep(delay) => {}
                            }
                        }
                        None => {
                            warn!("Cycle skipped after {} retries: {}", backoff.attempts(), e);
                            backoff.reset();
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("Cycle skipped: {}", e);
                        break;
                    }
                }
            }
        }

        self.log_shutdown_state();
        Ok(())
    }

    fn log_shutdown_state(&self) {
        info!("Shutdown requested, stopping loop");
        for position in self.engines.values().filter_map(|e| e.position()) {
            info!(
                "Leaving {} {} position open ({:.6} @ {:.2}, stop {:.2})",
                position.strategy, position.side, position.size, position.entry_price, position.stop_level
            );
        }
        if !self.pending_trades.is_empty() {
            error!(
                "{} trade record(s) still not persisted at shutdown",
                self.pending_trades.len()
            );
        }
        if self.settings.mode.is_dry_run() {
            info!(
                "Paper balance {:.2} ({:+.2}%), {:.2} available",
                self.paper.balance(),
                self.paper.pnl_percent(),
                self.paper.available()
            );
        }
    }

    /// One poll cycle evaluated at `now`
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> TradingResult<CycleReport> {
        self.cycle += 1;
        let span = info_span!("cycle", cycle = self.cycle, regime = field::Empty, cooldown = field::Empty);
        self.run_cycle_inner(now).instrument(span).await
    }

    async fn run_cycle_inner(&mut self, now: DateTime<Utc>) -> TradingResult<CycleReport> {
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        if self.cancelled(&mut report) {
            return Ok(report);
        }

        if self.detector.is_none() {
            self.initialize(now).await?;
        }

        // Phase 1: every view resolved before any decision
        let Some(views) = self.fetch_all(now, &mut report).await? else {
            return Ok(report);
        };

        // Phase 2: regime
        let regime_view = views
            .get(&self.settings.regime_timeframe)
            .ok_or_else(|| TradingError::Config("regime timeframe not fetched".into()))?;
        let regime_known = match self.latest_adx(regime_view) {
            Ok(adx_value) => {
                if let Some(detector) = self.detector.as_mut() {
                    report.regime_change = detector.evaluate(adx_value, now);
                }
                true
            }
            Err(e) if e.is_data_insufficient() => {
                warn!("Regime not evaluated, entries suppressed: {}", e);
                false
            }
            Err(e) => return Err(e),
        };

        let snapshot = self
            .regime()
            .ok_or_else(|| TradingError::data_insufficient("regime seed", 1, 0))?;
        let cooling_down = self.cooldown.is_cooling_down(&snapshot, now);
        report.regime = Some(snapshot.current);
        report.cooling_down = cooling_down;

        let span = Span::current();
        span.record("regime", field::display(snapshot.current));
        span.record("cooldown", cooling_down);

        match self.cooldown.remaining(&snapshot, now) {
            Some(left) => info!(
                "Regime {} (ADX {:.2}), cooldown {}m{}s left",
                snapshot.current,
                snapshot.last_adx,
                left.num_minutes(),
                left.num_seconds() % 60
            ),
            None => info!("Regime {} (ADX {:.2})", snapshot.current, snapshot.last_adx),
        }

        let ids: Vec<StrategyId> = self.engines.keys().copied().collect();

        // Phase 3: exits run whatever the gate says
        for &id in &ids {
            self.manage_open_position(id, &views, now, &mut report).await;
            if report.cancelled {
                return Ok(report);
            }
        }

        report.unrealized_pnl = self.log_open_positions(&views);

        // Phase 4: gated entries
        if regime_known {
            for &id in &ids {
                self.consider_entry(id, &snapshot, cooling_down, &views, now, &mut report).await;
                if report.cancelled {
                    return Ok(report);
                }
            }
        }

        // Phase 5
        self.replay_pending_trades();
        report.pending_trades = self.pending_trades.len();

        debug!(
            "Cycle {} done: opened={:?} closed={} stops_moved={}",
            report.cycle,
            report.opened,
            report.closed.len(),
            report.stops_moved.len()
        );
        Ok(report)
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// `None` when shutdown interrupted the fetch phase
    async fn fetch_all(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> TradingResult<Option<HashMap<String, MarketView>>> {
        let mut plan: BTreeMap<String, usize> = BTreeMap::new();
        plan.insert(self.settings.regime_timeframe.clone(), self.settings.regime_candle_limit);
        for engine in self.engines.values() {
            let limit = plan.entry(engine.timeframe().to_string()).or_insert(0);
            *limit = (*limit).max(engine.candle_limit());
        }

        let mut views = HashMap::with_capacity(plan.len());
        for (timeframe, limit) in plan {
            if self.cancelled(report) {
                return Ok(None);
            }
            let view = self.fetch_view(&timeframe, limit, now).await?;
            views.insert(timeframe, view);
        }
        Ok(Some(views))
    }

    async fn fetch_view(&self, timeframe: &str, limit: usize, now: DateTime<Utc>) -> TradingResult<MarketView> {
        let duration = parse_timeframe(timeframe)?;
        let candles = self
            .exchange
            .fetch_candles(&self.settings.symbol, timeframe, limit)
            .await?;
        let closed = closed_candles(candles, duration, now);
        debug!("{} {}: {} closed candles", self.settings.symbol, timeframe, closed.len());
        Ok(MarketView::new(timeframe, closed))
    }

    fn latest_adx(&self, view: &MarketView) -> TradingResult<f64> {
        let cols = PriceColumns::from_candles(&view.candles);
        let period = self.settings.adx_period;
        let series = adx(&cols.high, &cols.low, &cols.close, period);
        latest(&series, "adx", adx_warmup(period))
    }

    /// Status line per held position; returns the summed open PnL
    fn log_open_positions(&self, views: &HashMap<String, MarketView>) -> f64 {
        let mut total = 0.0;
        for engine in self.engines.values() {
            let Some(position) = engine.position() else {
                continue;
            };
            let Some(price) = views.get(engine.timeframe()).and_then(|v| v.price().ok()) else {
                continue;
            };
            let pnl = position.unrealized_pnl(price);
            total += pnl;
            info!(
                "{} holding {} {:.6} @ {:.2}, stop {:.2}, last {:.2}, uPnL {:+.2}",
                position.strategy, position.side, position.size, position.entry_price, position.stop_level, price, pnl
            );
        }
        total
    }

    fn cancelled(&self, report: &mut CycleReport) -> bool {
        if self.shutdown.is_cancelled() {
            info!("Shutdown requested, cycle {} stops here", report.cycle);
            report.cancelled = true;
        }
        report.cancelled
    }

    // =========================================================================
    // Exits
    // =========================================================================

    async fn manage_open_position(
        &mut self,
        id: StrategyId,
        views: &HashMap<String, MarketView>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let Some(engine) = self.engines.get(&id) else {
            return;
        };
        if !engine.has_position() {
            return;
        }
        let Some(view) = views.get(engine.timeframe()) else {
            return;
        };

        report.exits_evaluated.push(id);
        match engine.evaluate_exit(view) {
            Ok(Some(intent)) => self.execute_exit(intent, now, report).await,
            Ok(None) => self.trail_stop(id, view, report),
            Err(e) => warn!("{} exit check skipped: {}", id, e),
        }
    }

    fn trail_stop(&mut self, id: StrategyId, view: &MarketView, report: &mut CycleReport) {
        let Some(engine) = self.engines.get_mut(&id) else {
            return;
        };

        match engine.manage_stop(view) {
            Ok(Some(new_stop)) => {
                report.stops_moved.push((id, new_stop));
                if let Some(position) = engine.position() {
                    if let Err(e) = self.store.save_open_position(&self.settings.symbol, position) {
                        error!("Failed to persist moved stop for {}: {}", id, e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{} stop update skipped: {}", id, e),
        }
    }

    async fn execute_exit(&mut self, intent: ExitIntent, now: DateTime<Utc>, report: &mut CycleReport) {
        let id = intent.strategy;
        let Some(position) = self.position(id).cloned() else {
            return;
        };

        info!("{} EXIT {} {}: {}", id, position.side, intent.reason, intent.detail);
        let order = OrderRequest::close(self.settings.symbol.clone(), position.side, position.size);

        let fill = match self.fill(&order, intent.reference_price, report).await {
            Some(Ok(fill)) => fill,
            Some(Err(e)) => {
                warn!("{} exit abandoned, position kept: {}", id, e);
                report.abandoned.push((id, e.to_string()));
                return;
            }
            None => return,
        };

        let closed_size = fill.filled_size.min(position.size);
        let remaining = position.size - closed_size;
        let closed_part = Position {
            size: closed_size,
            ..position.clone()
        };
        let record = TradeRecord::from_closed_position(
            self.settings.symbol.clone(),
            &closed_part,
            fill.filled_price,
            now,
            intent.reason.as_str(),
        );

        if remaining > position.size * PARTIAL_FILL_TOLERANCE {
            self.keep_remainder(id, remaining, closed_size);
        } else {
            if let Some(engine) = self.engines.get_mut(&id) {
                engine.close_position();
            }
            if let Err(e) = self.store.remove_open_position(id) {
                error!("Failed to clear persisted position for {}, will retry: {}", id, e);
                self.stale_positions.insert(id);
            }
        }

        if self.settings.mode.is_dry_run() {
            self.paper.settle(id, record.pnl_absolute);
            if let Some(margin) = self.position(id).map(|rest| rest.entry_price * rest.size) {
                self.paper.reserve(id, margin);
            }
            info!(
                "[DRY RUN] Paper balance {:.2} after {:+.2}",
                self.paper.balance(),
                record.pnl_absolute
            );
            self.save_paper_account();
        }

        self.persist_trade(record.clone());
        report.closed.push(record);
    }

    /// Shrink the position to what a partial exit left open
    fn keep_remainder(&mut self, id: StrategyId, remaining: f64, closed_size: f64) {
        let Some(engine) = self.engines.get_mut(&id) else {
            return;
        };
        let Some(mut rest) = engine.close_position() else {
            return;
        };

        warn!(
            "{} exit partially filled: {:.6} closed, {:.6} stays open under stop {:.2}",
            id, closed_size, remaining, rest.stop_level
        );
        rest.size = remaining;
        engine.restore_position(rest.clone());

        match self.store.save_open_position(&self.settings.symbol, &rest) {
            Ok(()) => {
                self.stale_positions.remove(&id);
            }
            Err(e) => error!("Failed to persist remaining position for {}: {}", id, e),
        }
    }

    // =========================================================================
    // Entries
    // =========================================================================

    async fn consider_entry(
        &mut self,
        id: StrategyId,
        snapshot: &RegimeSnapshot,
        cooling_down: bool,
        views: &HashMap<String, MarketView>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let Some(engine) = self.engines.get(&id) else {
            return;
        };
        if engine.has_position() {
            return;
        }
        if !is_active(engine.required_regime(), snapshot, cooling_down) {
            debug!(
                "{} inactive (needs {}, regime {}, cooldown {})",
                id,
                engine.required_regime(),
                snapshot.current,
                cooling_down
            );
            return;
        }
        let Some(view) = views.get(engine.timeframe()) else {
            return;
        };

        report.entries_evaluated.push(id);
        match engine.evaluate_entry(view) {
            Ok(Some(intent)) => self.execute_entry(intent, now, report).await,
            Ok(None) => debug!("{} no entry signal", id),
            Err(e) => warn!("{} entry check skipped: {}", id, e),
        }
    }

    async fn execute_entry(&mut self, intent: EntryIntent, now: DateTime<Utc>, report: &mut CycleReport) {
        let id = intent.strategy;
        info!("{} ENTRY {} signal: {}", id, intent.side, intent.reason);

        let balance = match self.settings.mode {
            ExecutionMode::DryRun => self.paper.available(),
            ExecutionMode::Live => {
                if self.cancelled(report) {
                    return;
                }
                match self.exchange.free_balance(&self.settings.quote_asset).await {
                    Ok(balance) => balance,
                    Err(e) => {
                        warn!("{} entry abandoned, balance unavailable: {}", id, e);
                        report.abandoned.push((id, e.to_string()));
                        return;
                    }
                }
            }
        };

        let size = position_size(balance, self.settings.position_size_percent, intent.reference_price);
        if size < self.settings.min_order_size || size <= 0.0 {
            warn!(
                "{} entry skipped: size {:.8} below minimum {:.8} (balance {:.2})",
                id, size, self.settings.min_order_size, balance
            );
            report.abandoned.push((id, format!("size {:.8} below minimum", size)));
            return;
        }

        let order = OrderRequest::market(self.settings.symbol.clone(), intent.side.entry_order(), size);
        let fill = match self.fill(&order, intent.reference_price, report).await {
            Some(Ok(fill)) => fill,
            Some(Err(e)) => {
                warn!("{} entry abandoned: {}", id, e);
                report.abandoned.push((id, e.to_string()));
                return;
            }
            None => return,
        };

        let Some(engine) = self.engines.get_mut(&id) else {
            return;
        };
        let position = engine.open_position(&intent, &fill, now).clone();
        info!(
            "{} OPENED {} {:.6} @ {:.2}, stop {:.2}, target {}",
            id,
            position.side,
            position.size,
            position.entry_price,
            position.stop_level,
            position
                .target_level
                .map(|t| format!("{:.2}", t))
                .unwrap_or_else(|| "trailing".to_string())
        );

        if self.settings.mode.is_dry_run() {
            self.paper.reserve(id, position.entry_price * position.size);
            self.save_paper_account();
        }

        // The row is keyed by strategy, so a successful save replaces any stale one
        match self.store.save_open_position(&self.settings.symbol, &position) {
            Ok(()) => {
                self.stale_positions.remove(&id);
            }
            Err(e) => error!("Failed to persist open position for {}: {}", id, e),
        }
        report.opened.push(id);
    }

    // =========================================================================
    // Execution and persistence
    // =========================================================================

    /// Fill an order for real or on paper. `None` when shutdown arrived first.
    async fn fill(
        &self,
        order: &OrderRequest,
        reference_price: f64,
        report: &mut CycleReport,
    ) -> Option<TradingResult<OrderResult>> {
        match self.settings.mode {
            ExecutionMode::DryRun => {
                info!(
                    "[DRY RUN] {} {:.6} {} simulated at {:.2}",
                    order.side.as_str(),
                    order.size,
                    order.symbol,
                    reference_price
                );
                Some(Ok(OrderResult {
                    filled_price: reference_price,
                    filled_size: order.size,
                }))
            }
            ExecutionMode::Live => {
                if self.cancelled(report) {
                    return None;
                }
                Some(self.exchange.place_order(order).await)
            }
        }
    }

    fn save_paper_account(&mut self) {
        match self.store.save_paper_account(&self.paper) {
            Ok(()) => self.paper_dirty = false,
            Err(e) => {
                error!("Failed to persist paper account, will retry: {}", e);
                self.paper_dirty = true;
            }
        }
    }

    fn persist_trade(&mut self, record: TradeRecord) {
        // Keep the log in exit order: nothing jumps a queued record
        if !self.pending_trades.is_empty() {
            self.pending_trades.push_back(record);
            self.replay_pending_trades();
            return;
        }

        if let Err(e) = self.store.record_trade(&record) {
            error!(
                "ALARM: trade record for {} not persisted, queued for replay: {}",
                record.strategy_used, e
            );
            self.pending_trades.push_back(record);
        }
    }

    fn replay_pending_trades(&mut self) {
        if self.paper_dirty {
            self.save_paper_account();
        }

        let stale: Vec<StrategyId> = self.stale_positions.iter().copied().collect();
        for id in stale {
            if self.store.remove_open_position(id).is_ok() {
                debug!("Cleared persisted position for {}", id);
                self.stale_positions.remove(&id);
            }
        }

        while let Some(record) = self.pending_trades.front() {
            match self.store.record_trade(record) {
                Ok(id) => {
                    info!("Replayed queued trade record as #{}", id);
                    self.pending_trades.pop_front();
                }
                Err(e) => {
                    error!(
                        "ALARM: {} trade record(s) still queued: {}",
                        self.pending_trades.len(),
                        e
                    );
                    break;
                }
            }
        }
    }
}

/// Base-asset size for `percent` of `balance` at `price`
pub fn position_size(balance: f64, percent: f64, price: f64) -> f64 {
    if price <= 0.0 || balance <= 0.0 {
        return 0.0;
    }
    balance * percent / 100.0 / price
}
