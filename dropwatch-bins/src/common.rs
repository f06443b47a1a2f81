//! Common CLI parsing and setup shared by the binaries in this crate.

use anyhow::Result;
use clap::Parser;

/// CLI arguments shared by every binary that drives the engine.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Path to the engine's TOML configuration file.
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    /// Comma-separated list of symbols to track, e.g. "BTC-USDT,ETH-USDT".
    #[arg(short, long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Run against the simulated exchange adapter instead of a live one.
    #[arg(long, default_value = "true")]
    pub simulated: bool,

    /// Starting quote-currency budget tracked by the portfolio.
    #[arg(long, default_value = "10000")]
    pub initial_budget: String,

    /// Log level (overridden by RUST_LOG if set).
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// Initialize structured logging.
pub fn init_logging(level: &str, json_logs: bool) -> Result<()> {
    dropwatch_core::utils::logger::init_logger(level, json_logs);
    Ok(())
}
