//! Binance REST clients, USD-M futures and spot
//! Public klines need no key; orders, positions and balances are HMAC-signed.

use serde::{Deserialize, Serialize};

pub mod auth;
mod client;
mod futures;
mod types;

pub use auth::Credentials;
pub use client::{BinanceClient, SPOT_API_BASE};
pub use futures::{order_query, BinanceFuturesClient, FUTURES_API_BASE};
pub use types::*;

/// Which Binance market the bot trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinanceMarket {
    #[default]
    Futures,
    Spot,
}

impl BinanceMarket {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BinanceMarket::Futures => FUTURES_API_BASE,
            BinanceMarket::Spot => SPOT_API_BASE,
        }
    }
}

impl std::fmt::Display for BinanceMarket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinanceMarket::Futures => write!(f, "futures"),
            BinanceMarket::Spot => write!(f, "spot"),
        }
    }
}
