//! REST client for the quote, symbol search and symbol listing endpoints.

use crate::error::QuoteError;
use crate::models::{Quote, SymbolInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("stockwatch/", env!("CARGO_PKG_VERSION"));

/// Quote fields besides `symbol` and `current` that must be numeric when present.
const AUXILIARY_FIELDS: [&str; 6] = [
    "change",
    "percentChange",
    "high",
    "low",
    "open",
    "previousClose",
];

/// Source of single-symbol quotes.
#[async_trait]
pub trait QuoteApi: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, QuoteError>;
}

/// HTTP client for the quote service.
pub struct HttpQuoteApi {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpQuoteApi {
    /// Create a new client rooted at `base_url` (e.g. "http://localhost:3000").
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Search symbols by free-text query.
    pub async fn search_symbols(&self, query: &str) -> Result<Vec<SymbolInfo>, QuoteError> {
        let url = format!(
            "{}/api/symbol-search?q={}",
            self.base_url,
            urlencoding::encode(query)
        );
        let body = self.get_json(&url).await?;
        Ok(parse_symbol_list(body))
    }

    /// List one page of the symbols traded on `exchange`.
    pub async fn list_symbols(
        &self,
        exchange: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<SymbolInfo>, QuoteError> {
        let url = format!(
            "{}/api/stock-symbols?exchange={}&page={}&limit={}",
            self.base_url,
            urlencoding::encode(exchange),
            page,
            limit
        );
        let body = self.get_json(&url).await?;
        Ok(parse_symbol_list(body))
    }

    async fn get_json(&self, url: &str) -> Result<Value, QuoteError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QuoteError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl QuoteApi for HttpQuoteApi {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        let url = format!(
            "{}/api/quote?symbol={}",
            self.base_url,
            urlencoding::encode(symbol)
        );
        debug!(%symbol, "requesting quote");
        let body = self.get_json(&url).await?;
        parse_quote_payload(body)
    }
}

/// Validate a quote response body, unwrapping an optional `{success, data}` envelope.
pub fn parse_quote_payload(body: Value) -> Result<Quote, QuoteError> {
    let payload = unwrap_envelope(body)?;

    let symbol = payload
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| QuoteError::InvalidQuoteData("quote payload missing symbol".to_string()))?
        .to_ascii_uppercase();

    let current = number_field(&payload, "current").ok_or_else(|| {
        QuoteError::InvalidQuoteData(format!("quote payload missing current price for {symbol}"))
    })?;

    let mut auxiliary = [None; AUXILIARY_FIELDS.len()];
    for (slot, field) in auxiliary.iter_mut().zip(AUXILIARY_FIELDS) {
        match payload.get(field) {
            None | Some(Value::Null) => {}
            Some(_) => {
                *slot = Some(number_field(&payload, field).ok_or_else(|| {
                    QuoteError::InvalidQuoteData(format!(
                        "quote payload has invalid {field} for {symbol}"
                    ))
                })?);
            }
        }
    }
    let [change, percent_change, high, low, open, previous_close] = auxiliary;

    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(timestamp_from_epoch)
        .unwrap_or_else(Utc::now);

    Ok(Quote {
        symbol,
        current,
        change,
        percent_change,
        high,
        low,
        open,
        previous_close,
        timestamp,
    })
}

fn unwrap_envelope(body: Value) -> Result<Value, QuoteError> {
    let Value::Object(mut map) = body else {
        return Err(QuoteError::InvalidQuoteData(
            "quote payload is not an object".to_string(),
        ));
    };

    if let Some(success) = map.get("success").and_then(Value::as_bool) {
        if !success {
            let message = map
                .get("error")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(QuoteError::Rejected(message));
        }
        if let Some(data) = map.remove("data") {
            return Ok(data);
        }
    }

    Ok(Value::Object(map))
}

/// Read a finite number that may be encoded as a JSON number or a numeric string.
fn number_field(payload: &Value, field: &str) -> Option<f64> {
    let value = match payload.get(field)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Accepts both seconds and milliseconds since the epoch.
pub(crate) fn timestamp_from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= 1_000_000_000_000 {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    symbol: String,
    #[serde(default, alias = "description")]
    name: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
}

/// Decode a flat array or a `{data: [...]}` page of symbols, skipping malformed entries.
pub fn parse_symbol_list(body: Value) -> Vec<SymbolInfo> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("result")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawSymbol>(item).ok())
        .map(|raw| SymbolInfo {
            name: raw.name.unwrap_or_else(|| raw.symbol.clone()),
            symbol: raw.symbol,
            exchange: raw.exchange,
        })
        .collect()
}
