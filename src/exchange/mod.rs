//! Exchange collaborator interface
//!
//! The orchestrator talks to the market only through [`ExchangeClient`], so
//! the Binance futures and spot clients and scripted test doubles are
//! interchangeable.

use async_trait::async_trait;

use crate::error::TradingResult;
use crate::types::{Candle, ExchangePosition, OrderRequest, OrderResult, Symbol};

pub mod binance;

pub use binance::{BinanceClient, BinanceFuturesClient, BinanceMarket};

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// OHLCV candles, oldest first. The last one may still be in progress.
    async fn fetch_candles(&self, symbol: &Symbol, timeframe: &str, limit: usize) -> TradingResult<Vec<Candle>>;

    /// Place an order and wait for its fill.
    /// Fails with `TransientNetwork` or `ExchangeRejection`.
    async fn place_order(&self, order: &OrderRequest) -> TradingResult<OrderResult>;

    /// Net position the exchange holds for `symbol`, used to reconcile on restart
    async fn get_open_position(&self, symbol: &Symbol) -> TradingResult<Option<ExchangePosition>>;

    /// Whether `get_open_position` reflects real holdings. Spot accounts
    /// have balances, not positions.
    fn reports_positions(&self) -> bool {
        false
    }

    /// Free balance of one asset
    async fn free_balance(&self, asset: &str) -> TradingResult<f64>;
}
