//! Trend Sniper Strategy Module
//!
//! Trades the 1h timeframe while the market is TRENDING: enters Donchian
//! breakouts in the direction of the 200 EMA and rides them with a stop that
//! trails the opposite channel band.

pub mod config;
pub mod strategy;

pub use config::TrendSniperConfig;
pub use strategy::{decide_entry, decide_exit, trail_stop, TrendSniperStrategy, TrendSnapshot};
