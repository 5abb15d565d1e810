//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data. `datetime` is the candle's open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }
}

/// Trading pair symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one of the two strategy engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyId {
    MeanReversion,
    TrendSniper,
}

impl StrategyId {
    pub const ALL: [StrategyId; 2] = [StrategyId::MeanReversion, StrategyId::TrendSniper];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::MeanReversion => "MEAN_REVERSION",
            StrategyId::TrendSniper => "TREND_SNIPER",
        }
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "MEAN_REVERSION" => Ok(StrategyId::MeanReversion),
            "TREND_SNIPER" => Ok(StrategyId::TrendSniper),
            _ => Err(format!(
                "Unknown strategy: '{}'. Available: MEAN_REVERSION, TREND_SNIPER",
                s
            )),
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Order side that flattens a position in this direction
    pub fn exit_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(Side::Long),
            "SHORT" => Ok(Side::Short),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// Order direction on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

/// Order sent to the exchange collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub size: f64,
    pub order_type: OrderType,
    /// Only shrink an existing position (futures); ignored on spot
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: OrderSide, size: f64) -> Self {
        OrderRequest {
            symbol,
            side,
            size,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    /// Market order that flattens (part of) a `side` position
    pub fn close(symbol: Symbol, side: Side, size: f64) -> Self {
        OrderRequest {
            reduce_only: true,
            ..Self::market(symbol, side.exit_order(), size)
        }
    }
}

/// Fill reported by the exchange (or simulated in dry-run)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub filled_price: f64,
    pub filled_size: f64,
}

/// An open position owned by exactly one strategy engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub strategy: StrategyId,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_level: f64,
    /// Fixed profit target, if the strategy has one
    pub target_level: Option<f64>,
}

impl Position {
    /// Size with the side's sign, for netting against the exchange
    pub fn signed_size(&self) -> f64 {
        self.side.sign() * self.size
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            Side::Long => (current_price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - current_price) * self.size,
        }
    }
}

/// Position as reported by the exchange, used for restart reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
}

impl ExchangePosition {
    pub fn signed_size(&self) -> f64 {
        self.side.sign() * self.size
    }
}

/// Immutable record of a closed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Assigned by storage; `None` until written
    pub id: Option<i64>,
    pub symbol: Symbol,
    pub strategy_used: StrategyId,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl_absolute: f64,
    /// Fractional return, 0.01 = 1%
    pub pnl_percent: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: String,
}

impl TradeRecord {
    /// Build the record for a position closed at `exit_price`
    pub fn from_closed_position(
        symbol: Symbol,
        position: &Position,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_reason: impl Into<String>,
    ) -> Self {
        let pnl_percent = match position.side {
            Side::Long => (exit_price - position.entry_price) / position.entry_price,
            Side::Short => (position.entry_price - exit_price) / position.entry_price,
        };

        TradeRecord {
            id: None,
            symbol,
            strategy_used: position.strategy,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl_absolute: pnl_percent * position.entry_price * position.size,
            pnl_percent,
            entry_time: position.entry_time,
            exit_time,
            exit_reason: exit_reason.into(),
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl_absolute > 0.0
    }
}
