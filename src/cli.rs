//! Command-line interface.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Watch stock prices with live streaming, polling fallback and price alerts.
///
/// Prices arrive over a server-sent-event stream; while the stream is down
/// the watchlist is polled over REST. An alert fires once when a price
/// reaches its threshold.
#[derive(Parser, Debug, Clone)]
#[command(name = "stockwatch")]
#[command(version)]
#[command(about = "Stock watchlist with live prices and price alerts", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Symbols to watch with their alert price (comma-separated SYMBOL:ALERT)
    ///
    /// Example: AAPL:200,MSFT:450
    #[arg(short = 's', long, value_delimiter = ',', value_parser = parse_symbol_spec, env = "STOCKWATCH_SYMBOLS", global = true)]
    pub symbols: Option<Vec<SymbolSpec>>,

    /// Quote service base URL
    #[arg(long, env = "STOCKWATCH_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Polling cadence while the live stream is down (e.g. 30s, 2m)
    #[arg(short = 'i', long, value_parser = humantime::parse_duration, global = true)]
    pub interval: Option<Duration>,

    /// Poll only, do not open the live stream
    #[arg(long, global = true)]
    pub no_live: bool,

    /// Number of table redraws before exiting
    ///
    /// 0 means run until interrupted
    #[arg(short = 'n', long, default_value = "0", global = true)]
    pub iterations: u64,

    /// Configuration file path
    #[arg(short = 'c', long, env = "STOCKWATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Saved watchlist location
    #[arg(long, env = "STOCKWATCH_STATE_FILE", global = true)]
    pub state_file: Option<PathBuf>,

    /// Do not read or write the saved watchlist
    #[arg(long, global = true)]
    pub no_persist: bool,

    /// Ring the terminal bell when an alert fires
    #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "single", global = true)]
    pub bell: Option<BellPattern>,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// REST request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Watch the watchlist (default)
    Watch,
    /// Search ticker symbols
    Search {
        /// Name or symbol fragment
        query: String,
    },
    /// List symbols of an exchange
    Symbols {
        /// Exchange code
        #[arg(short = 'e', long, default_value = "US")]
        exchange: String,
        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,
        /// Symbols per page
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

/// Beep pattern for the terminal bell.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum BellPattern {
    #[default]
    Single,
    Double,
    Triple,
}

impl From<BellPattern> for crate::notifier::AlertSound {
    fn from(pattern: BellPattern) -> Self {
        match pattern {
            BellPattern::Single => crate::notifier::AlertSound::Single,
            BellPattern::Double => crate::notifier::AlertSound::Double,
            BellPattern::Triple => crate::notifier::AlertSound::Triple,
        }
    }
}

/// A `SYMBOL:ALERT` pair from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    pub symbol: String,
    pub alert_price: f64,
}

pub fn parse_symbol_spec(raw: &str) -> Result<SymbolSpec, String> {
    let (symbol, alert) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected SYMBOL:ALERT, got {raw:?}"))?;

    let symbol = crate::models::normalize_symbol(symbol)
        .ok_or_else(|| format!("missing symbol in {raw:?}"))?;
    let alert_price: f64 = alert
        .trim()
        .parse()
        .map_err(|_| format!("invalid alert price in {raw:?}"))?;
    if !alert_price.is_finite() || alert_price <= 0.0 {
        return Err(format!("alert price must be positive in {raw:?}"));
    }

    Ok(SymbolSpec { symbol, alert_price })
}

impl Args {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Args::parse()
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Watch)
    }
}
