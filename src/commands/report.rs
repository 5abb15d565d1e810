//! Report command: performance metrics from the trade log

use anyhow::{anyhow, Context, Result};
use tracing::info;

use regime_trader::analytics::PerformanceReport;
use regime_trader::storage::{SqliteTradeStore, TradeStore};
use regime_trader::StrategyId;

pub fn run(db_path: String, strategy: Option<String>) -> Result<()> {
    let filter = strategy
        .map(|s| s.parse::<StrategyId>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let store = SqliteTradeStore::open(&db_path).with_context(|| format!("Failed to open {}", db_path))?;
    let trades = store.closed_trades(None).context("Failed to read trades")?;
    info!("Loaded {} trades from {}", trades.len(), db_path);

    let strategies: Vec<StrategyId> = match filter {
        Some(id) => vec![id],
        None => {
            println!("\n{}", "=".repeat(60));
            println!("ALL STRATEGIES");
            println!("{}", "=".repeat(60));
            println!("{}", PerformanceReport::from_trades(&trades));
            StrategyId::ALL.to_vec()
        }
    };

    for id in strategies {
        println!("\n{}", "=".repeat(60));
        println!("{}", id);
        println!("{}", "=".repeat(60));
        println!("{}", PerformanceReport::for_strategy(&trades, id));
    }

    Ok(())
}
