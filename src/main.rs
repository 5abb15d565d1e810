//! Regime trader - main entry point
//!
//! Subcommands:
//! - run: Run the regime-switching loop (dry-run or live)
//! - report: Print performance metrics from the trade log
//! - export: Write the trade log to CSV
//! - serve: Read-only HTTP status API
//! - reset-paper: Start the dry-run paper account over

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "regime-trader")]
#[command(about = "ADX regime-switching trader: mean reversion when ranging, breakouts when trending", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Path to configuration file (defaults plus environment when absent)
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Force dry-run mode (no orders reach the exchange)
        #[arg(long)]
        dry_run: bool,

        /// Force live mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Cycle interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Trade database path (overrides config file)
        #[arg(long)]
        db: Option<String>,
    },

    /// Print performance metrics for recorded trades
    Report {
        /// Trade database path
        #[arg(long, default_value = "data/trades.db")]
        db: String,

        /// Only report one strategy (mean_reversion or trend_sniper)
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Export recorded trades to CSV
    Export {
        /// Trade database path
        #[arg(long, default_value = "data/trades.db")]
        db: String,

        /// Output CSV file
        #[arg(short, long, default_value = "trades.csv")]
        output: String,
    },

    /// Serve status, positions and recent trades over HTTP
    Serve {
        /// Trade database path
        #[arg(long, default_value = "data/trades.db")]
        db: String,

        /// Symbol whose open positions are listed
        #[arg(short, long, default_value = "BTC/USDT")]
        symbol: String,

        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: String,
    },

    /// Reset the dry-run paper account, dropping its open positions
    ResetPaper {
        /// Trade database path
        #[arg(long, default_value = "data/trades.db")]
        db: String,

        /// Starting balance (default: trading.simulated_balance default)
        #[arg(long)]
        balance: Option<f64>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Report { .. } => "report",
        Commands::Export { .. } => "export",
        Commands::Serve { .. } => "serve",
        Commands::ResetPaper { .. } => "reset_paper",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            live,
            interval,
            db,
        } => commands::run::run(config, dry_run, live, interval, db),

        Commands::Report { db, strategy } => commands::report::run(db, strategy),

        Commands::Export { db, output } => commands::export::run(db, output),

        Commands::Serve { db, symbol, bind } => commands::serve::run(db, symbol, bind),

        Commands::ResetPaper { db, balance } => commands::reset_paper::run(db, balance),
    }
}
