//! Export command: trade log to CSV

use anyhow::{Context, Result};
use std::fs::File;
use tracing::info;

use regime_trader::analytics::write_trades_csv;
use regime_trader::storage::{SqliteTradeStore, TradeStore};

pub fn run(db_path: String, output: String) -> Result<()> {
    let store = SqliteTradeStore::open(&db_path).with_context(|| format!("Failed to open {}", db_path))?;
    let trades = store.closed_trades(None).context("Failed to read trades")?;

    let file = File::create(&output).with_context(|| format!("Failed to create {}", output))?;
    write_trades_csv(&trades, file).context("Failed to write CSV")?;

    info!("Exported {} trades to {}", trades.len(), output);
    Ok(())
}
