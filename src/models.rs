//! Data models for quotes and watched stocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Most recent samples kept per stock; older ones are evicted first.
pub const MAX_PRICE_HISTORY: usize = 500;

/// A validated price quote, from the REST endpoint or a streamed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Ticker symbol (e.g., "AAPL")
    pub symbol: String,
    /// Latest traded price
    pub current: f64,
    /// Price change from previous close
    pub change: Option<f64>,
    /// Percentage change from previous close
    pub percent_change: Option<f64>,
    /// Day's high price
    pub high: Option<f64>,
    /// Day's low price
    pub low: Option<f64>,
    /// Opening price for the day
    pub open: Option<f64>,
    /// Previous closing price
    pub previous_close: Option<f64>,
    /// Timestamp of the quote
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// A bare price quote, as carried by a trade tick.
    pub fn from_price(symbol: impl Into<String>, current: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            current,
            change: None,
            percent_change: None,
            high: None,
            low: None,
            open: None,
            previous_close: None,
            timestamp,
        }
    }
}

/// One `{time, price}` sample of a stock's price history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub time: DateTime<Utc>,
    pub price: f64,
}

/// A ticker the user tracks, with its alert threshold and latest quote fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedStock {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub alert_price: f64,
    pub current_price: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub open: Option<f64>,
    pub previous_close: Option<f64>,
    pub price_history: VecDeque<PricePoint>,
    pub is_loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_alert_triggered: bool,
}

impl WatchedStock {
    /// Create a stock that has not received a price yet.
    pub fn new(symbol: impl Into<String>, name: impl Into<String>, alert_price: f64) -> Self {
        Self {
            id: new_stock_id(),
            symbol: symbol.into(),
            name: name.into(),
            alert_price,
            current_price: None,
            change: None,
            percent_change: None,
            high: None,
            low: None,
            open: None,
            previous_close: None,
            price_history: VecDeque::new(),
            is_loading: true,
            last_updated: None,
            is_alert_triggered: false,
        }
    }

    /// Apply an accepted quote: append a history sample and refresh every
    /// quote field, keeping the previous value for fields the quote omits.
    pub fn apply_quote(&mut self, quote: &Quote, now: DateTime<Utc>) {
        self.record_price(quote.timestamp, quote.current);

        self.current_price = Some(quote.current);
        self.change = quote.change.or(self.change);
        self.percent_change = quote.percent_change.or(self.percent_change);
        self.high = quote.high.or(self.high);
        self.low = quote.low.or(self.low);
        self.open = quote.open.or(self.open);
        self.previous_close = quote.previous_close.or(self.previous_close);
        self.is_loading = false;
        self.last_updated = Some(now);
    }

    fn record_price(&mut self, time: DateTime<Utc>, price: f64) {
        self.price_history.push_back(PricePoint { time, price });
        while self.price_history.len() > MAX_PRICE_HISTORY {
            self.price_history.pop_front();
        }
    }
}

/// Opaque, random stock identifier.
pub fn new_stock_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Trim and uppercase a ticker symbol. Returns `None` for blank input.
pub fn normalize_symbol(symbol: &str) -> Option<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_uppercase())
    }
}

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// A listed symbol returned by search and listing endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub name: String,
    pub exchange: Option<String>,
}
