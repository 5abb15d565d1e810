//! Read-only HTTP API over the trade store
//!
//! - `GET /api/health` - Liveness
//! - `GET /api/status` - Paper account, open position count, realized metrics
//! - `GET /api/positions` - Persisted open positions
//! - `GET /api/trades` - Last 50 closed trades, newest first
//!
//! The server reads the same SQLite file the trading loop writes, so it can
//! run in its own process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analytics::PerformanceReport;
use crate::error::TradingError;
use crate::paper::PaperAccount;
use crate::storage::TradeStore;
use crate::types::{Position, Symbol, TradeRecord};

/// Closed trades returned by `/api/trades`
pub const RECENT_TRADES: usize = 50;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            error: "internal_error".into(),
            message: message.into(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn storage_error(what: &str, e: TradingError) -> (StatusCode, Json<ApiError>) {
    error!(error = %e, "Failed to {}", what);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::internal(format!("Database error: {}", e))),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperSummary {
    pub initial_balance: f64,
    pub balance: f64,
    pub margin_used: f64,
    pub available: f64,
    pub pnl_percent: f64,
}

impl From<&PaperAccount> for PaperSummary {
    fn from(account: &PaperAccount) -> Self {
        PaperSummary {
            initial_balance: account.initial_balance(),
            balance: account.balance(),
            margin_used: account.margin_used(),
            available: account.available(),
            pnl_percent: account.pnl_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub symbol: String,
    /// `None` until a dry-run session has saved the paper account
    pub paper: Option<PaperSummary>,
    pub open_positions: usize,
    pub performance: PerformanceReport,
}

/// Shared state for API handlers
pub struct ApiState {
    pub store: Arc<dyn TradeStore>,
    pub symbol: Symbol,
}

impl ApiState {
    pub fn new(store: Arc<dyn TradeStore>, symbol: Symbol) -> Self {
        Self { store, symbol }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/status
pub async fn status(State(state): State<Arc<ApiState>>) -> ApiResult<StatusResponse> {
    let paper = state
        .store
        .load_paper_account()
        .map_err(|e| storage_error("load paper account", e))?;
    let positions = state
        .store
        .load_open_positions(&state.symbol)
        .map_err(|e| storage_error("load open positions", e))?;
    let trades = state
        .store
        .closed_trades(None)
        .map_err(|e| storage_error("load trades", e))?;

    Ok(Json(StatusResponse {
        symbol: state.symbol.to_string(),
        paper: paper.as_ref().map(PaperSummary::from),
        open_positions: positions.len(),
        performance: PerformanceReport::from_trades(&trades),
    }))
}

/// GET /api/positions
pub async fn positions(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<Position>> {
    state
        .store
        .load_open_positions(&state.symbol)
        .map(Json)
        .map_err(|e| storage_error("load open positions", e))
}

/// GET /api/trades
pub async fn trades(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<TradeRecord>> {
    let mut trades = state
        .store
        .closed_trades(None)
        .map_err(|e| storage_error("load trades", e))?;
    trades.reverse();
    trades.truncate(RECENT_TRADES);
    Ok(Json(trades))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/positions", get(positions))
        .route("/api/trades", get(trades))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(addr: SocketAddr, state: Arc<ApiState>, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status API stopped");
    Ok(())
}
