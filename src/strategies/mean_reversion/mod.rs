//! Mean Reversion Strategy Module
//!
//! Trades the 15m timeframe while the market is RANGING: fades closes outside
//! the Bollinger Bands when RSI confirms exhaustion, and exits at the 20-period
//! mean or at an ATR stop.

pub mod config;
pub mod strategy;

pub use config::MeanReversionConfig;
pub use strategy::{decide_entry, decide_exit, MeanReversionSnapshot, MeanReversionStrategy};
