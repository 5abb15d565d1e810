//! Execution mode and the simulated account used in dry-run
//!
//! The paper account mirrors a margin account: opening a position reserves
//! `entry_price * size` of quote balance, closing it releases the reservation
//! and books the realized PnL. It is persisted by the trade store so a
//! restarted dry-run continues where it stopped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::StrategyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Orders go to the exchange
    Live,
    /// Every decision is logged, fills are simulated at the decision price
    DryRun,
}

impl ExecutionMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, ExecutionMode::DryRun)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Live => f.write_str("LIVE"),
            ExecutionMode::DryRun => f.write_str("DRY RUN"),
        }
    }
}

/// Quote-currency paper balance with per-strategy margin reservations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    initial_balance: f64,
    balance: f64,
    reserved: BTreeMap<StrategyId, f64>,
}

impl PaperAccount {
    pub fn new(initial_balance: f64) -> Self {
        PaperAccount {
            initial_balance,
            balance: initial_balance,
            reserved: BTreeMap::new(),
        }
    }

    /// Rebuild a persisted account
    pub fn from_parts(initial_balance: f64, balance: f64, reserved: BTreeMap<StrategyId, f64>) -> Self {
        PaperAccount {
            initial_balance,
            balance,
            reserved,
        }
    }

    /// Realized equity, margin included
    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn margin_used(&self) -> f64 {
        self.reserved.values().sum()
    }

    /// Balance not tied up in open positions; what entries are sized from
    pub fn available(&self) -> f64 {
        self.balance - self.margin_used()
    }

    pub fn reservations(&self) -> &BTreeMap<StrategyId, f64> {
        &self.reserved
    }

    pub fn is_reserved(&self, strategy: StrategyId) -> bool {
        self.reserved.contains_key(&strategy)
    }

    /// Lock `margin` for the position `strategy` just opened
    pub fn reserve(&mut self, strategy: StrategyId, margin: f64) {
        self.reserved.insert(strategy, margin);
    }

    /// Drop a reservation without booking PnL; returns the released margin
    pub fn release(&mut self, strategy: StrategyId) -> Option<f64> {
        self.reserved.remove(&strategy)
    }

    /// Close the position of `strategy`: release its margin and book `pnl`
    pub fn settle(&mut self, strategy: StrategyId, pnl: f64) {
        self.reserved.remove(&strategy);
        self.balance += pnl;
    }

    pub fn total_pnl(&self) -> f64 {
        self.balance - self.initial_balance
    }

    /// PnL as percentage of the starting balance
    pub fn pnl_percent(&self) -> f64 {
        if self.initial_balance <= 0.0 {
            return 0.0;
        }
        self.total_pnl() / self.initial_balance * 100.0
    }
}
