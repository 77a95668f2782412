//! Plain-text rendering of the watchlist for batch output.

use crate::connection::ConnectionSnapshot;
use crate::models::{SymbolInfo, WatchedStock};
use chrono::{DateTime, Local};
use std::fmt::Write;

/// Render the status line and watchlist table.
pub fn render_watchlist(
    stocks: &[WatchedStock],
    connection: &ConnectionSnapshot,
    error: Option<&str>,
    now: DateTime<Local>,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n=== STOCKWATCH {} ===", now.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "{}", status_line(connection));
    if let Some(error) = error {
        let _ = writeln!(out, "! {error}");
    }

    let _ = writeln!(
        out,
        "{:<8} {:<20} {:>12} {:>10} {:>9} {:>12}  {}",
        "SYMBOL", "NAME", "PRICE", "CHANGE", "CHG%", "ALERT", ""
    );
    let _ = writeln!(out, "{}", "-".repeat(82));

    for stock in stocks {
        let price = match stock.current_price {
            Some(price) => format_price(price),
            None if stock.is_loading => "loading".to_string(),
            None => "-".to_string(),
        };
        let marker = if stock.is_alert_triggered { "ALERT" } else { "" };

        let _ = writeln!(
            out,
            "{:<8} {:<20} {:>12} {:>10} {:>9} {:>12}  {}",
            stock.symbol,
            truncate_string(&stock.name, 20),
            price,
            format_signed(stock.change, ""),
            format_signed(stock.percent_change, "%"),
            format_price(stock.alert_price),
            marker
        );
    }

    out
}

/// Render symbol search or listing results.
pub fn render_symbols(symbols: &[SymbolInfo]) -> String {
    if symbols.is_empty() {
        return "No matching symbols.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<10} {:<40} {}", "SYMBOL", "NAME", "EXCHANGE");
    for info in symbols {
        let _ = writeln!(
            out,
            "{:<10} {:<40} {}",
            info.symbol,
            truncate_string(&info.name, 40),
            info.exchange.as_deref().unwrap_or("-")
        );
    }
    out
}

fn status_line(connection: &ConnectionSnapshot) -> String {
    let mut line = format!("stream: {}", connection.status);
    if connection.connection_attempts > 0 {
        let _ = write!(line, " (attempt {})", connection.connection_attempts);
    }
    if let Some(delay) = connection.reconnect_delay {
        let _ = write!(line, ", reconnect in {}", humantime::format_duration(delay));
    }
    if connection.polling_active {
        match connection.polling_interval {
            Some(interval) => {
                let _ = write!(line, ", polling every {}", humantime::format_duration(interval));
            }
            None => line.push_str(", polling"),
        }
    }
    line
}

fn format_price(price: f64) -> String {
    if price >= 1.0 {
        format!("${:.2}", price)
    } else {
        format!("${:.6}", price)
    }
}

fn format_signed(value: Option<f64>, suffix: &str) -> String {
    match value {
        Some(v) => format!("{:+.2}{}", v, suffix),
        None => "-".to_string(),
    }
}

/// Truncate to `max_len` characters, marking the cut with `...`.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        ".".repeat(max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}
