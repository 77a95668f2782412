//! Server-sent-event price stream.
//!
//! One stream carries trades for every watched symbol. Messages are decoded
//! into [`StreamMessage`] at this boundary; unknown shapes are rejected.

use crate::error::StreamError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;

/// Raw `data:` payloads of the events received on one connection.
pub type EventStream = BoxStream<'static, Result<String, StreamError>>;

/// Opens the streaming connection for a symbol set.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, symbols: &[String]) -> Result<EventStream, StreamError>;
}

/// Message pushed by the streaming proxy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Trade {
        data: TradeData,
    },
    Connected {
        #[serde(default)]
        message: Option<String>,
        #[serde(default, deserialize_with = "symbol_list")]
        symbols: Vec<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    pub symbol: String,
    pub price: f64,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub percent_change: Option<f64>,
}

/// Accepts `["A","B"]` or `"A,B"`.
fn symbol_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Symbols {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Symbols>::deserialize(deserializer)? {
        Some(Symbols::List(list)) => list,
        Some(Symbols::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}

pub fn decode_message(data: &str) -> Result<StreamMessage, StreamError> {
    Ok(serde_json::from_str(data)?)
}

/// Longest line the decoder will hold while waiting for its newline.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Incremental `text/event-stream` parser.
///
/// Feed it raw body chunks; it returns the `data` of every event completed by
/// the chunk. Multi-line data is joined with `\n`; comments and fields other
/// than `data` are ignored. A pending line longer than [`MAX_LINE_LENGTH`]
/// is a transport error.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            let pending = self.buffer.len();
            self.buffer.clear();
            self.data.clear();
            return Err(StreamError::Transport(format!(
                "event line exceeds {MAX_LINE_LENGTH} bytes ({pending} pending)"
            )));
        }

        Ok(events)
    }
}

/// HTTP transport against the `/api/websocket-proxy` event stream.
pub struct SseTransport {
    client: Client,
    base_url: String,
}

impl SseTransport {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        // No overall timeout: the response body is long-lived.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        format!(
            "{}/api/websocket-proxy?symbols={}",
            self.base_url,
            urlencoding::encode(&symbols.join(","))
        )
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn open(&self, symbols: &[String]) -> Result<EventStream, StreamError> {
        let url = self.stream_url(symbols);
        debug!(%url, "opening event stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Connect(format!(
                "stream endpoint returned {status}"
            )));
        }

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => match decoder.push(&bytes) {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(err) => vec![Err(err)],
                },
                Err(e) => vec![Err(StreamError::Transport(e.to_string()))],
            })
            .flat_map(stream::iter)
            .boxed();

        Ok(events)
    }
}
