//! Regime-Switching Trading System
//!
//! Classifies the market as RANGING or TRENDING from a hysteretic ADX reading
//! and routes entries to the strategy built for that regime: Bollinger/RSI
//! mean reversion on 15m candles while ranging, Donchian breakouts above or
//! below the 200 EMA on 1h candles while trending. Open positions keep being
//! managed whichever regime is active.

pub mod analytics;
pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod market;
pub mod orchestrator;
pub mod paper;
pub mod regime;
pub mod storage;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use error::{TradingError, TradingResult};
pub use orchestrator::{CycleReport, Orchestrator};
pub use regime::{RegimeSnapshot, RegimeState};
pub use types::*;
