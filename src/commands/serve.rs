//! Serve command: read-only status API over the trade database

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use regime_trader::api::{self, ApiState};
use regime_trader::storage::SqliteTradeStore;
use regime_trader::Symbol;

pub fn run(db_path: String, symbol: String, bind: String) -> Result<()> {
    let addr: SocketAddr = bind.parse().with_context(|| format!("Invalid bind address {}", bind))?;
    let store = SqliteTradeStore::open(&db_path).with_context(|| format!("Failed to open {}", db_path))?;
    let state = Arc::new(ApiState::new(Arc::new(store), Symbol::new(symbol)));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, stopping API...");
                    signal_token.cancel();
                }
                Err(e) => error!("Error setting up signal handler: {}", e),
            }
        });

        api::serve(addr, state, shutdown)
            .await
            .with_context(|| format!("API server on {} failed", addr))
    })
}
