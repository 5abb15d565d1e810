//! Binance REST payloads

use chrono::{TimeZone, Utc};
use serde::Deserialize;

use crate::types::{Candle, ExchangePosition, Side, Symbol};

/// Kline row: [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Clone)]
pub struct BinanceKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl BinanceKline {
    /// Parse from raw JSON array returned by Binance API
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 7 {
            return None;
        }

        Some(BinanceKline {
            open_time: raw[0].as_i64()?,
            open: raw[1].as_str()?.parse().ok()?,
            high: raw[2].as_str()?.parse().ok()?,
            low: raw[3].as_str()?.parse().ok()?,
            close: raw[4].as_str()?.parse().ok()?,
            volume: raw[5].as_str()?.parse().ok()?,
            close_time: raw[6].as_i64()?,
        })
    }

    /// Validated candle, `None` for rows that fail OHLC sanity checks
    pub fn to_candle(&self) -> Option<Candle> {
        let datetime = Utc.timestamp_millis_opt(self.open_time).single()?;
        Candle::new(datetime, self.open, self.high, self.low, self.close, self.volume).ok()
    }
}

/// Error body: {"code": -2010, "msg": "Account has insufficient balance..."}
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceApiError {
    pub code: i64,
    pub msg: String,
}

/// Response of POST /api/v3/order with newOrderRespType=FULL
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: i64,
    pub status: String,
    pub executed_qty: String,
    pub cummulative_quote_qty: String,
}

impl OrderResponse {
    /// (average fill price, filled quantity) once the order has filled
    pub fn fill(&self) -> Option<(f64, f64)> {
        let qty: f64 = self.executed_qty.parse().ok()?;
        let quote: f64 = self.cummulative_quote_qty.parse().ok()?;
        (qty > 0.0).then(|| (quote / qty, qty))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub balances: Vec<AccountBalance>,
}

/// Response of POST /fapi/v1/order with newOrderRespType=RESULT
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesOrderResponse {
    pub symbol: String,
    pub order_id: i64,
    pub status: String,
    pub executed_qty: String,
    pub avg_price: String,
}

impl FuturesOrderResponse {
    /// (average fill price, filled quantity) once anything executed
    pub fn fill(&self) -> Option<(f64, f64)> {
        let qty: f64 = self.executed_qty.parse().ok()?;
        let price: f64 = self.avg_price.parse().ok()?;
        (qty > 0.0 && price > 0.0).then_some((price, qty))
    }
}

/// Row of GET /fapi/v2/positionRisk. `position_amt` is signed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    #[serde(default)]
    pub position_side: String,
}

/// Net the position rows of one symbol; `None` when flat
pub fn net_position(symbol: &Symbol, rows: &[PositionRisk]) -> Option<ExchangePosition> {
    let pair = to_binance_pair(symbol);
    let mut net = 0.0;
    let mut notional = 0.0;
    for row in rows.iter().filter(|r| r.symbol == pair) {
        let amount: f64 = row.position_amt.parse().unwrap_or(0.0);
        let entry: f64 = row.entry_price.parse().unwrap_or(0.0);
        net += amount;
        notional += amount * entry;
    }

    if net.abs() < f64::EPSILON {
        return None;
    }
    Some(ExchangePosition {
        symbol: symbol.clone(),
        side: if net > 0.0 { Side::Long } else { Side::Short },
        size: net.abs(),
        entry_price: notional / net,
    })
}

/// Row of GET /fapi/v2/balance
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesBalance {
    pub asset: String,
    pub balance: String,
    pub available_balance: String,
}

/// "BTC/USDT" -> "BTCUSDT"
pub fn to_binance_pair(symbol: &Symbol) -> String {
    symbol.as_str().replace(['/', '-'], "").to_uppercase()
}
