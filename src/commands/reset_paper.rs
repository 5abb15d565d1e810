//! Reset-paper command: start the dry-run account over

use anyhow::{Context, Result};
use tracing::{info, warn};

use regime_trader::config::TradingConfig;
use regime_trader::storage::{SqliteTradeStore, TradeStore};

pub fn run(db_path: String, balance: Option<f64>) -> Result<()> {
    let initial = balance.unwrap_or_else(|| TradingConfig::default().simulated_balance);
    if !(initial > 0.0 && initial.is_finite()) {
        anyhow::bail!("Starting balance must be positive, got {}", initial);
    }

    let store = SqliteTradeStore::open(&db_path).with_context(|| format!("Failed to open {}", db_path))?;
    if let Some(previous) = store.load_paper_account().context("Failed to read paper account")? {
        warn!(
            "Discarding paper account at {:.2} ({:+.2}%) with {:.2} margin in use",
            previous.balance(),
            previous.pnl_percent(),
            previous.margin_used()
        );
    }

    let account = store
        .reset_paper_account(initial)
        .context("Failed to reset paper account")?;
    info!("Paper account reset to {:.2} in {}", account.balance(), db_path);
    Ok(())
}
