//! Binance spot client implementing [`ExchangeClient`]
//!
//! Read-only calls (klines, account) are retried with exponential backoff on
//! transient failures. Orders are sent exactly once: a timed-out order may
//! have reached the matching engine, so it is reported and never resent.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info};

use super::auth::{Credentials, API_KEY_HEADER};
use super::types::{to_binance_pair, AccountResponse, BinanceApiError, BinanceKline, OrderResponse};
use crate::backoff::{retry_transient, RetryPolicy};
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeClient;
use crate::types::{Candle, ExchangePosition, OrderRequest, OrderResult, OrderType, Symbol};

/// Spot REST host
pub const SPOT_API_BASE: &str = "https://api.binance.com";

/// Maximum klines per request (Binance limit)
const MAX_KLINES_PER_REQUEST: usize = 1000;

pub(super) const RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

impl BinanceClient {
    pub fn new(credentials: Option<Credentials>, retry: RetryPolicy) -> TradingResult<Self> {
        Self::with_base_url(SPOT_API_BASE, credentials, retry)
    }

    /// Point the client at another host (e.g. the spot testnet)
    pub fn with_base_url(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        retry: RetryPolicy,
    ) -> TradingResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(BinanceClient {
            client,
            base_url: base_url.into(),
            credentials,
            retry,
        })
    }

    fn credentials(&self) -> TradingResult<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| TradingError::Config("BINANCE_API_KEY / BINANCE_API_SECRET not set".into()))
    }

    /// Fetch klines, oldest first
    pub async fn get_klines(&self, pair: &str, interval: &str, limit: usize) -> TradingResult<Vec<BinanceKline>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let params = [
            ("symbol", pair.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        debug!("Fetching klines: symbol={}, interval={}, limit={}", pair, interval, limit);

        let response = self.client.get(&url).query(&params).send().await?;
        let raw_data: Vec<Vec<serde_json::Value>> = check_status(response).await?.json().await?;

        Ok(raw_data.iter().filter_map(|row| BinanceKline::from_raw(row)).collect())
    }

    async fn get_account(&self) -> TradingResult<AccountResponse> {
        let creds = self.credentials()?;
        let query = format!("recvWindow={}&timestamp={}", RECV_WINDOW_MS, Utc::now().timestamp_millis());
        let url = format!("{}/api/v3/account?{}", self.base_url, creds.signed_query(&query));

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, creds.api_key())
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn post_market_order(&self, order: &OrderRequest) -> TradingResult<OrderResponse> {
        let creds = self.credentials()?;
        let order_type = match order.order_type {
            OrderType::Market => "MARKET",
        };
        let query = format!(
            "symbol={}&side={}&type={}&quantity={}&newOrderRespType=FULL&recvWindow={}&timestamp={}",
            to_binance_pair(&order.symbol),
            order.side.as_str(),
            order_type,
            format_quantity(order.size),
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        );
        let url = format!("{}/api/v3/order?{}", self.base_url, creds.signed_query(&query));

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, creds.api_key())
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn fetch_candles(&self, symbol: &Symbol, timeframe: &str, limit: usize) -> TradingResult<Vec<Candle>> {
        let pair = to_binance_pair(symbol);
        let what = format!("fetch {} {} klines", pair, timeframe);
        let pair = pair.as_str();

        let klines = retry_transient(&self.retry, &what, move || self.get_klines(pair, timeframe, limit)).await?;
        Ok(klines.iter().filter_map(BinanceKline::to_candle).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> TradingResult<OrderResult> {
        info!(
            "Placing {} MARKET order: {} {}",
            order.side.as_str(),
            format_quantity(order.size),
            to_binance_pair(&order.symbol)
        );

        let response = self.post_market_order(order).await?;
        // A market order that ran out of liquidity ends EXPIRED with part executed
        let (filled_price, filled_size) = response.fill().ok_or_else(|| {
            TradingError::ExchangeRejection(format!(
                "order {} ended {} with nothing executed",
                response.order_id, response.status
            ))
        })?;

        info!(
            "Order {} {}: {} @ {:.2}",
            response.order_id, response.status, filled_size, filled_price
        );
        Ok(OrderResult {
            filled_price,
            filled_size,
        })
    }

    /// Spot accounts hold balances, not positions
    async fn get_open_position(&self, _symbol: &Symbol) -> TradingResult<Option<ExchangePosition>> {
        Ok(None)
    }

    async fn free_balance(&self, asset: &str) -> TradingResult<f64> {
        let account = retry_transient(&self.retry, "fetch account", move || self.get_account()).await?;

        Ok(account
            .balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .and_then(|b| b.free.parse().ok())
            .unwrap_or(0.0))
    }
}

/// Map a non-success HTTP response onto the error taxonomy
pub(super) async fn check_status(response: Response) -> TradingResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_error(status, &body))
}

pub(super) fn classify_error(status: StatusCode, body: &str) -> TradingError {
    let detail = serde_json::from_str::<BinanceApiError>(body)
        .map(|e| format!("{} (code {})", e.msg, e.code))
        .unwrap_or_else(|_| body.to_string());

    // 429/418 are rate limit bans that lift with time
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        TradingError::TransientNetwork(format!("Binance API error {}: {}", status, detail))
    } else {
        TradingError::ExchangeRejection(format!("Binance API error {}: {}", status, detail))
    }
}

/// Quantity with at most 8 decimals and no trailing zeros
pub(super) fn format_quantity(size: f64) -> String {
    let formatted = format!("{:.8}", size);
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert!(classify_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn test_client_errors_are_rejections() {
        let err = classify_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        match err {
            TradingError::ExchangeRejection(msg) => {
                assert!(msg.contains("insufficient balance"));
                assert!(msg.contains("-2010"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(0.001), "0.001");
        assert_eq!(format_quantity(1.0), "1");
        assert_eq!(format_quantity(0.123456789), "0.12345679");
    }

    #[tokio::test]
    async fn test_signed_calls_need_credentials() {
        let client = BinanceClient::new(None, RetryPolicy::default()).unwrap();
        let err = client.free_balance("USDT").await.unwrap_err();
        assert!(matches!(err, TradingError::Config(_)));
    }
}
