//! Binance USD-M futures client implementing [`ExchangeClient`]
//!
//! Same retry rules as the spot client. The account is expected in one-way
//! mode, so every strategy trades the single net position of the symbol and
//! exits are sent reduce-only.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info};

use super::auth::{Credentials, API_KEY_HEADER};
use super::client::{check_status, format_quantity, RECV_WINDOW_MS};
use super::types::{net_position, to_binance_pair, BinanceKline, FuturesBalance, FuturesOrderResponse, PositionRisk};
use crate::backoff::{retry_transient, RetryPolicy};
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeClient;
use crate::types::{Candle, ExchangePosition, OrderRequest, OrderResult, OrderType, Symbol};

/// USD-M futures REST host
pub const FUTURES_API_BASE: &str = "https://fapi.binance.com";

const MAX_KLINES_PER_REQUEST: usize = 1500;

#[derive(Debug, Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

impl BinanceFuturesClient {
    pub fn new(credentials: Option<Credentials>, retry: RetryPolicy) -> TradingResult<Self> {
        Self::with_base_url(FUTURES_API_BASE, credentials, retry)
    }

    /// Point the client at another host (e.g. the futures testnet)
    pub fn with_base_url(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        retry: RetryPolicy,
    ) -> TradingResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(BinanceFuturesClient {
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

    pub async fn get_klines(&self, pair: &str, interval: &str, limit: usize) -> TradingResult<Vec<BinanceKline>> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let params = [
            ("symbol", pair.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        debug!("Fetching futures klines: symbol={}, interval={}, limit={}", pair, interval, limit);

        let response = self.client.get(&url).query(&params).send().await?;
        let raw_data: Vec<Vec<serde_json::Value>> = check_status(response).await?.json().await?;

        Ok(raw_data.iter().filter_map(|row| BinanceKline::from_raw(row)).collect())
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &str) -> TradingResult<T> {
        let creds = self.credentials()?;
        let url = format!("{}{}?{}", self.base_url, path, creds.signed_query(query));

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, creds.api_key())
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn get_position_risk(&self, pair: &str) -> TradingResult<Vec<PositionRisk>> {
        let query = format!(
            "symbol={}&recvWindow={}&timestamp={}",
            pair,
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        );
        self.signed_get("/fapi/v2/positionRisk", &query).await
    }

    async fn get_balances(&self) -> TradingResult<Vec<FuturesBalance>> {
        let query = format!("recvWindow={}&timestamp={}", RECV_WINDOW_MS, Utc::now().timestamp_millis());
        self.signed_get("/fapi/v2/balance", &query).await
    }

    async fn post_market_order(&self, order: &OrderRequest) -> TradingResult<FuturesOrderResponse> {
        let creds = self.credentials()?;
        let query = order_query(order, Utc::now().timestamp_millis());
        let url = format!("{}/fapi/v1/order?{}", self.base_url, creds.signed_query(&query));

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, creds.api_key())
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

/// Unsigned query string of a futures market order
pub fn order_query(order: &OrderRequest, timestamp_ms: i64) -> String {
    let order_type = match order.order_type {
        OrderType::Market => "MARKET",
    };
    let mut query = format!(
        "symbol={}&side={}&type={}&quantity={}",
        to_binance_pair(&order.symbol),
        order.side.as_str(),
        order_type,
        format_quantity(order.size)
    );
    if order.reduce_only {
        query.push_str("&reduceOnly=true");
    }
    query.push_str(&format!(
        "&newOrderRespType=RESULT&recvWindow={}&timestamp={}",
        RECV_WINDOW_MS, timestamp_ms
    ));
    query
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn fetch_candles(&self, symbol: &Symbol, timeframe: &str, limit: usize) -> TradingResult<Vec<Candle>> {
        let pair = to_binance_pair(symbol);
        let what = format!("fetch {} {} futures klines", pair, timeframe);
        let pair = pair.as_str();

        let klines = retry_transient(&self.retry, &what, move || self.get_klines(pair, timeframe, limit)).await?;
        Ok(klines.iter().filter_map(BinanceKline::to_candle).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> TradingResult<OrderResult> {
        info!(
            "Placing {} MARKET{} futures order: {} {}",
            order.side.as_str(),
            if order.reduce_only { " reduce-only" } else { "" },
            format_quantity(order.size),
            to_binance_pair(&order.symbol)
        );

        let response = self.post_market_order(order).await?;
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

    async fn get_open_position(&self, symbol: &Symbol) -> TradingResult<Option<ExchangePosition>> {
        let pair = to_binance_pair(symbol);
        let what = format!("fetch {} position", pair);
        let pair = pair.as_str();

        let rows = retry_transient(&self.retry, &what, move || self.get_position_risk(pair)).await?;
        Ok(net_position(symbol, &rows))
    }

    fn reports_positions(&self) -> bool {
        true
    }

    async fn free_balance(&self, asset: &str) -> TradingResult<f64> {
        let balances = retry_transient(&self.retry, "fetch futures balance", move || self.get_balances()).await?;

        Ok(balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .and_then(|b| b.available_balance.parse().ok())
            .unwrap_or(0.0))
    }
}
