// Trade storage
// SQLite-backed append-only trade log plus the open position of each strategy,
// so a restarted process can hand every engine back its position. Dry-run
// keeps its paper account (balance and reserved margin) in the same file.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{TradingError, TradingResult};
use crate::paper::PaperAccount;
use crate::types::{Position, StrategyId, Symbol, TradeRecord};

/// Persistence contract used by the orchestrator
pub trait TradeStore: Send + Sync {
    /// Append a closed trade, returning its assigned id
    fn record_trade(&self, trade: &TradeRecord) -> TradingResult<i64>;

    /// Closed trades in exit order, optionally for one strategy
    fn closed_trades(&self, strategy: Option<StrategyId>) -> TradingResult<Vec<TradeRecord>>;

    /// Insert or replace the open position of `position.strategy`
    fn save_open_position(&self, symbol: &Symbol, position: &Position) -> TradingResult<()>;

    fn remove_open_position(&self, strategy: StrategyId) -> TradingResult<()>;

    fn load_open_positions(&self, symbol: &Symbol) -> TradingResult<Vec<Position>>;

    /// Persisted paper account, `None` before the first save
    fn load_paper_account(&self) -> TradingResult<Option<PaperAccount>>;

    fn save_paper_account(&self, account: &PaperAccount) -> TradingResult<()>;

    /// Start the paper account over at `initial_balance`. Open positions that
    /// hold paper margin are dropped with it.
    fn reset_paper_account(&self, initial_balance: f64) -> TradingResult<PaperAccount>;
}

// =============================================================================
// SQLite Implementation
// =============================================================================

/// Writes serialize on the connection mutex
#[derive(Clone)]
pub struct SqliteTradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTradeStore {
    pub fn open(db_path: impl AsRef<Path>) -> TradingResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| TradingError::Storage(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self::from_connection(conn)?;
        info!("Trade store opened at {}", db_path.display());
        Ok(store)
    }

    pub fn in_memory() -> TradingResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> TradingResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn lock(&self) -> TradingResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TradingError::Storage("connection mutex poisoned".into()))
    }

    fn create_tables(&self) -> TradingResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy_used TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size REAL NOT NULL,
                pnl_absolute REAL NOT NULL,
                pnl_percent REAL NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                exit_reason TEXT NOT NULL DEFAULT '',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS open_positions (
                strategy TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                size REAL NOT NULL,
                entry_time TEXT NOT NULL,
                stop_level REAL NOT NULL,
                target_level REAL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS paper_account (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                initial_balance REAL NOT NULL,
                balance REAL NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS paper_margin (
                strategy TEXT PRIMARY KEY,
                margin_used REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_used)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }
}

impl TradeStore for SqliteTradeStore {
    fn record_trade(&self, trade: &TradeRecord) -> TradingResult<i64> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO trades
             (symbol, strategy_used, side, entry_price, exit_price, size,
              pnl_absolute, pnl_percent, entry_time, exit_time, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.symbol.as_str(),
                trade.strategy_used.as_str(),
                trade.side.as_str(),
                trade.entry_price,
                trade.exit_price,
                trade.size,
                trade.pnl_absolute,
                trade.pnl_percent,
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.exit_reason,
            ],
        )?;
        let id = conn.last_insert_rowid();

        info!(
            "Trade recorded #{}: {} {} {} {:.6} @ {:.2} -> {:.2} | PnL {:.2} ({:+.2}%) | {}",
            id,
            trade.strategy_used,
            trade.side,
            trade.symbol,
            trade.size,
            trade.entry_price,
            trade.exit_price,
            trade.pnl_absolute,
            trade.pnl_percent * 100.0,
            trade.exit_reason
        );
        Ok(id)
    }

    fn closed_trades(&self, strategy: Option<StrategyId>) -> TradingResult<Vec<TradeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, strategy_used, side, entry_price, exit_price, size,
                    pnl_absolute, pnl_percent, entry_time, exit_time, exit_reason
             FROM trades
             WHERE ?1 IS NULL OR strategy_used = ?1
             ORDER BY exit_time, id",
        )?;

        let trades = stmt
            .query_map(params![strategy.map(|s| s.as_str())], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    fn save_open_position(&self, symbol: &Symbol, position: &Position) -> TradingResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT OR REPLACE INTO open_positions
             (strategy, symbol, side, entry_price, size, entry_time, stop_level, target_level, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)",
            params![
                position.strategy.as_str(),
                symbol.as_str(),
                position.side.as_str(),
                position.entry_price,
                position.size,
                position.entry_time.to_rfc3339(),
                position.stop_level,
                position.target_level,
            ],
        )?;

        debug!(
            "Open position saved: {} {} {:.6} @ {:.2} stop {:.2}",
            position.strategy, position.side, position.size, position.entry_price, position.stop_level
        );
        Ok(())
    }

    fn remove_open_position(&self, strategy: StrategyId) -> TradingResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM open_positions WHERE strategy = ?1",
            params![strategy.as_str()],
        )?;
        Ok(())
    }

    fn load_open_positions(&self, symbol: &Symbol) -> TradingResult<Vec<Position>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT strategy, side, entry_price, size, entry_time, stop_level, target_level
             FROM open_positions WHERE symbol = ?1 ORDER BY strategy",
        )?;

        let positions = stmt
            .query_map(params![symbol.as_str()], |row| {
                Ok(Position {
                    strategy: parse_column(row, 0)?,
                    side: parse_column(row, 1)?,
                    entry_price: row.get(2)?,
                    size: row.get(3)?,
                    entry_time: time_column(row, 4)?,
                    stop_level: row.get(5)?,
                    target_level: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    fn load_paper_account(&self) -> TradingResult<Option<PaperAccount>> {
        let conn = self.lock()?;
        let Some((initial_balance, balance)) = conn
            .query_row(
                "SELECT initial_balance, balance FROM paper_account WHERE id = 1",
                [],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT strategy, margin_used FROM paper_margin")?;
        let reserved = stmt
            .query_map([], |row| Ok((parse_column::<StrategyId>(row, 0)?, row.get::<_, f64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Some(PaperAccount::from_parts(initial_balance, balance, reserved)))
    }

    fn save_paper_account(&self, account: &PaperAccount) -> TradingResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO paper_account (id, initial_balance, balance, updated_at)
             VALUES (1, ?1, ?2, CURRENT_TIMESTAMP)",
            params![account.initial_balance(), account.balance()],
        )?;
        tx.execute("DELETE FROM paper_margin", [])?;
        for (strategy, margin) in account.reservations() {
            tx.execute(
                "INSERT INTO paper_margin (strategy, margin_used) VALUES (?1, ?2)",
                params![strategy.as_str(), margin],
            )?;
        }
        tx.commit()?;

        debug!(
            "Paper account saved: balance {:.2}, margin {:.2}",
            account.balance(),
            account.margin_used()
        );
        Ok(())
    }

    fn reset_paper_account(&self, initial_balance: f64) -> TradingResult<PaperAccount> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let dropped = tx.execute(
            "DELETE FROM open_positions WHERE strategy IN (SELECT strategy FROM paper_margin)",
            [],
        )?;
        tx.execute("DELETE FROM paper_margin", [])?;
        tx.execute(
            "INSERT OR REPLACE INTO paper_account (id, initial_balance, balance, updated_at)
             VALUES (1, ?1, ?1, CURRENT_TIMESTAMP)",
            params![initial_balance],
        )?;
        tx.commit()?;

        info!(
            "Paper account reset to {:.2}, {} paper position(s) dropped",
            initial_balance, dropped
        );
        Ok(PaperAccount::new(initial_balance))
    }
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        id: Some(row.get(0)?),
        symbol: Symbol::new(row.get::<_, String>(1)?),
        strategy_used: parse_column(row, 2)?,
        side: parse_column(row, 3)?,
        entry_price: row.get(4)?,
        exit_price: row.get(5)?,
        size: row.get(6)?,
        pnl_absolute: row.get(7)?,
        pnl_percent: row.get(8)?,
        entry_time: time_column(row, 9)?,
        exit_time: time_column(row, 10)?,
        exit_reason: row.get(11)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
