//! Error taxonomy for the trading core
//!
//! Every fallible operation in the library returns [`TradingError`]. The
//! orchestrator decides what to do with a failure purely from its variant:
//! transient network errors are retried with backoff, insufficient data skips
//! one evaluation, rejections abandon one intent, storage errors are queued
//! for replay, and configuration errors stop the process at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Exchange unreachable, timed out, or answered with a server-side error
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Not enough closed candles for an indicator window
    #[error("insufficient data for {indicator}: need {required} candles, have {available}")]
    DataInsufficient {
        indicator: String,
        required: usize,
        available: usize,
    },

    /// Exchange refused the order (insufficient balance, filters, ...)
    #[error("order rejected by exchange: {0}")]
    ExchangeRejection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TradingError {
    pub fn data_insufficient(indicator: impl Into<String>, required: usize, available: usize) -> Self {
        TradingError::DataInsufficient {
            indicator: indicator.into(),
            required,
            available,
        }
    }

    /// Whether the failure may clear up by retrying the same call
    pub fn is_transient(&self) -> bool {
        matches!(self, TradingError::TransientNetwork(_))
    }

    pub fn is_data_insufficient(&self) -> bool {
        matches!(self, TradingError::DataInsufficient { .. })
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        // Decoding a body we did receive is not going to succeed on retry
        if err.is_decode() {
            TradingError::ExchangeRejection(format!("malformed response: {}", err))
        } else {
            TradingError::TransientNetwork(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        TradingError::Storage(err.to_string())
    }
}

pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(TradingError::TransientNetwork("timeout".into()).is_transient());
        assert!(!TradingError::ExchangeRejection("balance".into()).is_transient());
        assert!(!TradingError::Storage("locked".into()).is_transient());
        assert!(!TradingError::data_insufficient("adx", 28, 10).is_transient());
    }

    #[test]
    fn test_data_insufficient_message() {
        let err = TradingError::data_insufficient("ema_200", 200, 150);
        assert!(err.is_data_insufficient());
        assert_eq!(
            err.to_string(),
            "insufficient data for ema_200: need 200 candles, have 150"
        );
    }
}
