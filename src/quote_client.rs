//! Deduplicating quote client.
//!
//! Concurrent requests for the same symbol share one network call. The shared
//! pending entry lives for a short window after it is created and is dropped
//! early when the request fails, so a retry can go out straight away.

use crate::api::QuoteApi;
use crate::error::QuoteError;
use crate::models::{Quote, normalize_symbol};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a pending request is shared with later callers.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(2);
/// Symbols requested concurrently by [`QuoteClient::fetch_multiple_quotes`].
pub const BATCH_SIZE: usize = 5;
/// Pause between two batches.
pub const BATCH_DELAY: Duration = Duration::from_millis(200);

type SharedQuote = Shared<BoxFuture<'static, Result<Quote, QuoteError>>>;

struct PendingRequest {
    id: u64,
    created: Instant,
    result: SharedQuote,
}

pub struct QuoteClient {
    api: Arc<dyn QuoteApi>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_id: AtomicU64,
    dedup_window: Duration,
    batch_size: usize,
    batch_delay: Duration,
}

impl QuoteClient {
    pub fn new(api: Arc<dyn QuoteApi>) -> Self {
        Self {
            api,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            dedup_window: DEDUP_WINDOW,
            batch_size: BATCH_SIZE,
            batch_delay: BATCH_DELAY,
        }
    }

    /// Fetch one quote, joining an in-flight request for the same symbol if any.
    pub async fn fetch_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        let symbol =
            normalize_symbol(symbol).ok_or_else(|| QuoteError::InvalidSymbol(symbol.to_string()))?;

        let (id, request) = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            pending.retain(|_, entry| now.duration_since(entry.created) < self.dedup_window);

            match pending.get(&symbol) {
                Some(entry) => {
                    debug!(%symbol, "joining in-flight quote request");
                    (entry.id, entry.result.clone())
                }
                None => {
                    let api = Arc::clone(&self.api);
                    let key = symbol.clone();
                    let request = async move { api.fetch_quote(&key).await }.boxed().shared();
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    pending.insert(
                        symbol.clone(),
                        PendingRequest {
                            id,
                            created: now,
                            result: request.clone(),
                        },
                    );
                    (id, request)
                }
            }
        };

        let result = request.await;

        if let Err(err) = &result {
            debug!(%symbol, error = %err, "quote request failed");
            let mut pending = self.pending.lock();
            if pending.get(&symbol).is_some_and(|entry| entry.id == id) {
                pending.remove(&symbol);
            }
        }

        result
    }

    /// Fetch quotes in fixed-size batches. Failed symbols are logged and left
    /// out of the returned map.
    pub async fn fetch_multiple_quotes(&self, symbols: &[String]) -> HashMap<String, Quote> {
        let mut quotes = HashMap::with_capacity(symbols.len());

        for (index, batch) in symbols.chunks(self.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|symbol| async move { (symbol, self.fetch_quote(symbol).await) }),
            )
            .await;

            for (symbol, result) in results {
                match result {
                    Ok(quote) => {
                        let key = normalize_symbol(symbol).unwrap_or_else(|| quote.symbol.clone());
                        quotes.insert(key, quote);
                    }
                    Err(err) => warn!(%symbol, error = %err, "skipping symbol in batch quote fetch"),
                }
            }
        }

        quotes
    }

    /// Number of requests currently shared with new callers.
    pub fn pending_requests(&self) -> usize {
        let now = Instant::now();
        self.pending
            .lock()
            .values()
            .filter(|entry| now.duration_since(entry.created) < self.dedup_window)
            .count()
    }
}
