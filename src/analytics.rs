//! Performance analytics over recorded trades

use std::io;

use serde::{Deserialize, Serialize};

use crate::types::{StrategyId, TradeRecord};

const CSV_HEADER: [&str; 12] = [
    "id",
    "symbol",
    "strategy_used",
    "side",
    "entry_price",
    "exit_price",
    "size",
    "pnl_absolute",
    "pnl_percent",
    "entry_time",
    "exit_time",
    "exit_reason",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage, 0-100
    pub win_rate: f64,
    /// Gross profit / gross loss; infinite with no losses, 0 with no trades
    pub profit_factor: f64,
    pub total_pnl: f64,
    /// Peak-to-trough decline of cumulative PnL, percent of the peak
    pub max_drawdown: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}

impl PerformanceReport {
    /// Trades must be in exit order
    pub fn from_trades<'a>(trades: impl IntoIterator<Item = &'a TradeRecord>) -> Self {
        let pnls: Vec<f64> = trades.into_iter().map(|t| t.pnl_absolute).collect();
        if pnls.is_empty() {
            return Self::default();
        }

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        PerformanceReport {
            total_trades: pnls.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64 * 100.0,
            profit_factor,
            total_pnl: pnls.iter().sum(),
            max_drawdown: max_drawdown(&pnls),
            avg_win: if wins.is_empty() { 0.0 } else { gross_profit / wins.len() as f64 },
            avg_loss: if losses.is_empty() { 0.0 } else { gross_loss / losses.len() as f64 },
            best_trade: pnls.iter().copied().fold(f64::MIN, f64::max),
            worst_trade: pnls.iter().copied().fold(f64::MAX, f64::min),
        }
    }

    /// Report over the trades of one strategy
    pub fn for_strategy(trades: &[TradeRecord], strategy: StrategyId) -> Self {
        Self::from_trades(trades.iter().filter(|t| t.strategy_used == strategy))
    }
}

/// Max drawdown of the cumulative PnL curve starting at zero. Drawdowns only
/// count once the curve has made a positive peak.
fn max_drawdown(pnls: &[f64]) -> f64 {
    let mut equity = 0.0;
    let mut peak = 0.0_f64;
    let mut max_dd = 0.0_f64;

    for pnl in pnls {
        equity += pnl;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak * 100.0);
        }
    }

    max_dd
}

/// Write trades as CSV, one row per trade with a header line
pub fn write_trades_csv<W: io::Write>(trades: &[TradeRecord], writer: W) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CSV_HEADER)?;

    for trade in trades {
        wtr.write_record(&[
            trade.id.map(|id| id.to_string()).unwrap_or_default(),
            trade.symbol.to_string(),
            trade.strategy_used.to_string(),
            trade.side.to_string(),
            trade.entry_price.to_string(),
            trade.exit_price.to_string(),
            trade.size.to_string(),
            trade.pnl_absolute.to_string(),
            trade.pnl_percent.to_string(),
            trade.entry_time.to_rfc3339(),
            trade.exit_time.to_rfc3339(),
            trade.exit_reason.clone(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

impl std::fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  Total Trades:    {}", self.total_trades)?;
        writeln!(f, "  Winning Trades:  {}", self.winning_trades)?;
        writeln!(f, "  Losing Trades:   {}", self.losing_trades)?;
        writeln!(f, "  Win Rate:        {:.2}%", self.win_rate)?;
        writeln!(f, "  Profit Factor:   {:.2}", self.profit_factor)?;
        writeln!(f, "  Total PnL:       {:.2}", self.total_pnl)?;
        writeln!(f, "  Max Drawdown:    {:.2}%", self.max_drawdown)?;
        writeln!(f, "  Avg Win:         {:.2}", self.avg_win)?;
        writeln!(f, "  Avg Loss:        {:.2}", self.avg_loss)?;
        writeln!(f, "  Best Trade:      {:.2}", self.best_trade)?;
        write!(f, "  Worst Trade:     {:.2}", self.worst_trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn trade(strategy: StrategyId, pnl: f64) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: None,
            symbol: Symbol::new("BTC/USDT"),
            strategy_used: strategy,
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl_absolute: pnl,
            pnl_percent: pnl / 100.0,
            entry_time: now,
            exit_time: now,
            exit_reason: String::new(),
        }
    }

    #[test]
    fn test_empty_report() {
        let report = PerformanceReport::from_trades(&Vec::<TradeRecord>::new());
        assert_eq!(report, PerformanceReport::default());
    }

    #[test]
    fn test_metrics() {
        let trades: Vec<_> = [100.0, -50.0, 200.0, -100.0]
            .iter()
            .map(|p| trade(StrategyId::MeanReversion, *p))
            .collect();
        let report = PerformanceReport::from_trades(&trades);

        assert_eq!(report.total_trades, 4);
        assert_eq!(report.winning_trades, 2);
        assert_relative_eq!(report.win_rate, 50.0);
        assert_relative_eq!(report.profit_factor, 2.0);
        assert_relative_eq!(report.total_pnl, 150.0);
        assert_relative_eq!(report.avg_win, 150.0);
        assert_relative_eq!(report.avg_loss, 75.0);
        assert_relative_eq!(report.best_trade, 200.0);
        assert_relative_eq!(report.worst_trade, -100.0);
        // Curve 100, 50, 250, 150: worst decline is 100 -> 50
        assert_relative_eq!(report.max_drawdown, 50.0);
    }

    #[test]
    fn test_no_losses_gives_infinite_profit_factor() {
        let trades = vec![trade(StrategyId::TrendSniper, 10.0)];
        assert!(PerformanceReport::from_trades(&trades).profit_factor.is_infinite());
    }

    #[test]
    fn test_per_strategy_filter() {
        let trades = vec![
            trade(StrategyId::MeanReversion, 10.0),
            trade(StrategyId::TrendSniper, -5.0),
            trade(StrategyId::TrendSniper, 20.0),
        ];
        let report = PerformanceReport::for_strategy(&trades, StrategyId::TrendSniper);
        assert_eq!(report.total_trades, 2);
        assert_relative_eq!(report.total_pnl, 15.0);
    }

    #[test]
    fn test_csv_export() {
        let mut trade = trade(StrategyId::MeanReversion, 12.5);
        trade.id = Some(7);
        trade.exit_reason = "TAKE_PROFIT".to_string();

        let mut buf = Vec::new();
        write_trades_csv(&[trade], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,symbol,strategy_used,side"));
        assert!(lines[1].starts_with("7,BTC/USDT,MEAN_REVERSION,LONG,100,112.5,1,12.5,"));
        assert!(lines[1].ends_with(",TAKE_PROFIT"));
    }
}
