//! Hand-written fakes for the store's collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use stockwatch::api::QuoteApi;
use stockwatch::error::{QuoteError, StreamError};
use stockwatch::models::Quote;
use stockwatch::notifier::{AlertNotification, Notifier};
use stockwatch::persistence::{KeyValueStore, MemoryStore};
use stockwatch::store::{StoreDeps, StoreSettings, WatchlistStore};
use stockwatch::stream::{EventStream, StreamTransport};

/// Quote service with fixed prices.
#[derive(Default)]
pub struct FakeQuoteApi {
    prices: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl FakeQuoteApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().insert(symbol.to_string(), price);
    }

    pub fn fail(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self, symbol: &str) -> usize {
        self.calls.lock().get(symbol).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl QuoteApi for FakeQuoteApi {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        *self.calls.lock().entry(symbol.to_string()).or_default() += 1;

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(symbol) {
            return Err(QuoteError::Http {
                status: 404,
                message: format!("unknown symbol {symbol}"),
            });
        }
        let price = self.prices.lock().get(symbol).copied();
        match price {
            Some(price) => Ok(Quote::from_price(symbol, price, Utc::now())),
            None => Err(QuoteError::InvalidQuoteData(format!(
                "quote payload missing current price for {symbol}"
            ))),
        }
    }
}

/// Stream transport whose events are pushed by the test.
#[derive(Default)]
pub struct FakeTransport {
    senders: Mutex<Vec<UnboundedSender<Result<String, StreamError>>>>,
    opened: Mutex<Vec<Vec<String>>>,
    fail_open: AtomicBool,
    hang_open: AtomicBool,
    attempts: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every open attempt fail immediately.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every open attempt wait forever.
    pub fn set_hang_open(&self, hang: bool) {
        self.hang_open.store(hang, Ordering::SeqCst);
    }

    /// Open attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Symbol sets of the successfully opened streams.
    pub fn opened(&self) -> Vec<Vec<String>> {
        self.opened.lock().clone()
    }

    /// Push a raw event onto the newest stream.
    pub fn send(&self, data: &str) {
        if let Some(tx) = self.senders.lock().last() {
            let _ = tx.unbounded_send(Ok(data.to_string()));
        }
    }

    pub fn send_trade(&self, symbol: &str, price: f64) {
        self.send(&format!(
            r#"{{"type":"trade","data":{{"symbol":"{symbol}","price":{price}}}}}"#
        ));
    }

    /// Fail the newest stream with a transport error.
    pub fn fail_stream(&self, message: &str) {
        if let Some(tx) = self.senders.lock().last() {
            let _ = tx.unbounded_send(Err(StreamError::Transport(message.to_string())));
        }
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn open(&self, symbols: &[String]) -> Result<EventStream, StreamError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang_open.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(StreamError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        self.senders.lock().push(tx);
        self.opened.lock().push(symbols.to_vec());
        Ok(rx.boxed())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<AlertNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &AlertNotification) {
        self.alerts.lock().push(notification.clone());
    }
}

pub struct Harness {
    pub store: WatchlistStore,
    pub api: Arc<FakeQuoteApi>,
    pub transport: Arc<FakeTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(StoreSettings::default())
    }

    pub fn with_settings(settings: StoreSettings) -> Self {
        Self::with_storage(settings, Arc::new(MemoryStore::new()))
    }

    pub fn with_storage(settings: StoreSettings, storage: Arc<MemoryStore>) -> Self {
        let api = FakeQuoteApi::new();
        let transport = FakeTransport::new();
        let notifier = RecordingNotifier::new();
        let store = WatchlistStore::new(
            StoreDeps {
                api: api.clone(),
                transport: transport.clone(),
                notifier: notifier.clone(),
                storage: Some(storage.clone() as Arc<dyn KeyValueStore>),
            },
            settings,
        );

        Self {
            store,
            api,
            transport,
            notifier,
            storage,
        }
    }

    /// Settings with live data off, so no stream is opened.
    pub fn offline() -> Self {
        Self::with_settings(StoreSettings {
            live_data_enabled: false,
            ..StoreSettings::default()
        })
    }
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock and let tasks react.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}
