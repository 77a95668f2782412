//! Watchlist store.
//!
//! The single state container of the application: watched stocks, the
//! streaming connection, the polling fallback and refresh settings all live
//! behind one mutex so every mutation is atomic to observers. The store is
//! constructed explicitly and shared by cloning; clones refer to the same
//! state.
//!
//! Methods that start the stream or timers spawn Tokio tasks and must be
//! called from within a Tokio runtime.

use crate::alert::{self, compose_notification};
use crate::api::QuoteApi;
use crate::connection::{ConnectionSettings, ConnectionSnapshot, ConnectionState};
use crate::error::StoreError;
use crate::models::{Quote, WatchedStock, normalize_symbol};
use crate::notifier::{AlertNotification, Notifier};
use crate::persistence::{self, DEFAULT_REFRESH_INTERVAL, KeyValueStore, PersistedState};
use crate::polling::PollingState;
use crate::quote_client::QuoteClient;
use crate::stream::StreamTransport;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default minimum spacing between two accepted price updates of a symbol.
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Updates closer than this to the last accepted one are dropped.
    pub throttle_window: Duration,
    /// Nominal polling cadence; see [`crate::polling::polling_interval`].
    pub refresh_interval: Duration,
    pub live_data_enabled: bool,
    pub connection: ConnectionSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            live_data_enabled: true,
            connection: ConnectionSettings::default(),
        }
    }
}

/// External collaborators of the store.
pub struct StoreDeps {
    pub api: Arc<dyn QuoteApi>,
    pub transport: Arc<dyn StreamTransport>,
    pub notifier: Arc<dyn Notifier>,
    pub storage: Option<Arc<dyn KeyValueStore>>,
}

/// What happened to a price update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUpdate {
    Applied { notified: bool },
    Throttled,
    UnknownSymbol,
}

#[derive(Debug)]
pub(crate) struct RefreshConfig {
    pub(crate) live_data_enabled: bool,
    pub(crate) refresh_interval: Duration,
}

#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) stocks: Vec<WatchedStock>,
    pub(crate) connection: ConnectionState,
    pub(crate) polling: PollingState,
    pub(crate) refresh: RefreshConfig,
    /// Last accepted update per symbol.
    throttle: HashMap<String, Instant>,
    pub(crate) error: Option<String>,
}

impl StoreState {
    pub(crate) fn symbols(&self) -> Vec<String> {
        self.stocks.iter().map(|s| s.symbol.clone()).collect()
    }

    fn persisted(&self) -> PersistedState {
        PersistedState::capture(
            &self.stocks,
            self.refresh.refresh_interval,
            self.refresh.live_data_enabled,
        )
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<StoreState>,
    pub(crate) quotes: QuoteClient,
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) settings: StoreSettings,
    notifier: Arc<dyn Notifier>,
    storage: Option<Arc<dyn KeyValueStore>>,
    revision: watch::Sender<u64>,
}

impl Shared {
    /// The single write path for price data, shared by streaming and polling.
    pub(crate) fn update_price_locked(
        &self,
        state: &mut StoreState,
        symbol: &str,
        quote: &Quote,
    ) -> (PriceUpdate, Option<AlertNotification>) {
        let now = Instant::now();
        let Some(stock) = state.stocks.iter_mut().find(|s| s.symbol == symbol) else {
            return (PriceUpdate::UnknownSymbol, None);
        };

        if let Some(last) = state.throttle.get(symbol) {
            if now.duration_since(*last) < self.settings.throttle_window {
                debug!(%symbol, price = quote.current, "throttled price update");
                return (PriceUpdate::Throttled, None);
            }
        }
        state.throttle.insert(symbol.to_string(), now);

        stock.apply_quote(quote, Utc::now());
        let outcome = alert::evaluate(stock, quote.current);
        stock.is_alert_triggered = outcome.triggered;
        let notification = outcome
            .should_notify
            .then(|| compose_notification(&stock.symbol, quote.current, stock.alert_price));

        state.error = None;
        (
            PriceUpdate::Applied {
                notified: notification.is_some(),
            },
            notification,
        )
    }

    /// Deliver a fired alert and publish the change. Call without the lock held.
    pub(crate) fn finish_price_update(
        &self,
        update: PriceUpdate,
        notification: Option<AlertNotification>,
    ) {
        if let Some(notification) = notification {
            info!(
                symbol = %notification.symbol,
                price = notification.price,
                alert_price = notification.alert_price,
                "price alert triggered"
            );
            self.notifier.notify(&notification);
        }
        if matches!(update, PriceUpdate::Applied { .. }) {
            self.bump_revision();
        }
    }

    pub(crate) fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Best effort; failures are logged.
    fn save(&self, snapshot: &PersistedState) {
        if let Some(storage) = &self.storage {
            if let Err(err) = persistence::save(storage.as_ref(), snapshot) {
                warn!(error = %err, "failed to save watchlist");
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.connection.abort_all();
        state.polling.abort();
    }
}

/// Handle to the watchlist. Cheap to clone.
#[derive(Clone)]
pub struct WatchlistStore {
    shared: Arc<Shared>,
}

impl WatchlistStore {
    /// Build a store, restoring the saved watchlist from `deps.storage` if present.
    pub fn new(deps: StoreDeps, settings: StoreSettings) -> Self {
        let mut state = StoreState {
            stocks: Vec::new(),
            connection: ConnectionState::default(),
            polling: PollingState::default(),
            refresh: RefreshConfig {
                live_data_enabled: settings.live_data_enabled,
                refresh_interval: settings.refresh_interval,
            },
            throttle: HashMap::new(),
            error: None,
        };

        if let Some(storage) = &deps.storage {
            match persistence::load(storage.as_ref()) {
                Ok(Some(saved)) => {
                    info!(
                        stocks = saved.watched_stocks.len(),
                        live_data = saved.is_live_data_enabled,
                        "restored saved watchlist"
                    );
                    state.refresh.refresh_interval = saved.refresh_interval();
                    state.refresh.live_data_enabled = saved.is_live_data_enabled;
                    state.stocks = saved.watched_stocks;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "ignoring unreadable saved watchlist"),
            }
        }

        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                quotes: QuoteClient::new(deps.api),
                transport: deps.transport,
                settings,
                notifier: deps.notifier,
                storage: deps.storage,
                revision,
            }),
        }
    }

    /// Add a stock. Rejections are also recorded in [`Self::error`].
    pub fn add_stock(&self, symbol: &str, name: &str, alert_price: f64) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();

        let symbol = match validate(symbol, Some(alert_price)) {
            Ok(symbol) => symbol,
            Err(err) => return self.reject(&mut state, err),
        };
        if state.stocks.iter().any(|s| s.symbol == symbol) {
            return self.reject(&mut state, StoreError::DuplicateSymbol(symbol));
        }

        let name = match name.trim() {
            "" => symbol.clone(),
            name => name.to_string(),
        };
        info!(%symbol, alert_price, "adding stock to watchlist");
        state.stocks.push(WatchedStock::new(symbol, name, alert_price));
        state.error = None;

        self.shared.symbols_changed_locked(&mut state);
        self.commit(state);
        Ok(())
    }

    pub fn remove_stock(&self, symbol: &str) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();

        let symbol = match validate(symbol, None) {
            Ok(symbol) => symbol,
            Err(err) => return self.reject(&mut state, err),
        };
        let Some(index) = state.stocks.iter().position(|s| s.symbol == symbol) else {
            return self.reject(&mut state, StoreError::UnknownSymbol(symbol));
        };

        info!(%symbol, "removing stock from watchlist");
        state.stocks.remove(index);
        state.throttle.remove(&symbol);
        state.error = None;

        self.shared.symbols_changed_locked(&mut state);
        self.commit(state);
        Ok(())
    }

    /// Change the alert threshold and re-arm the alert.
    pub fn update_alert_price(&self, symbol: &str, alert_price: f64) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();

        let symbol = match validate(symbol, Some(alert_price)) {
            Ok(symbol) => symbol,
            Err(err) => return self.reject(&mut state, err),
        };
        let Some(index) = state.stocks.iter().position(|s| s.symbol == symbol) else {
            return self.reject(&mut state, StoreError::UnknownSymbol(symbol));
        };

        let stock = &mut state.stocks[index];
        stock.alert_price = alert_price;
        stock.is_alert_triggered = false;
        info!(%symbol, alert_price, "alert price updated");
        state.error = None;

        self.commit(state);
        Ok(())
    }

    /// Apply a quote through the throttled price-update path.
    pub fn update_price(&self, symbol: &str, quote: &Quote) -> PriceUpdate {
        let Some(symbol) = normalize_symbol(symbol) else {
            return PriceUpdate::UnknownSymbol;
        };
        let (update, notification) = {
            let mut state = self.shared.state.lock();
            self.shared.update_price_locked(&mut state, &symbol, quote)
        };
        self.shared.finish_price_update(update, notification);
        update
    }

    /// Turn live data on (connect the stream) or off (stop stream and polling).
    pub fn set_live_data_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.refresh.live_data_enabled = enabled;

        if enabled {
            info!("live data enabled");
            self.shared.connect_locked(&mut state);
        } else {
            info!("live data disabled");
            self.shared.stop_polling_locked(&mut state);
            self.shared.disconnect_locked(&mut state);
        }
        self.commit(state);
    }

    /// Change the nominal polling cadence, restarting an active poll timer.
    pub fn set_refresh_interval(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        state.refresh.refresh_interval = interval;
        if state.polling.is_active() && state.refresh.live_data_enabled {
            self.shared.start_polling_locked(&mut state);
        }
        self.commit(state);
    }

    /// Open the stream for the current watchlist. See [`ConnectionSnapshot`].
    pub fn connect(&self) {
        let mut state = self.shared.state.lock();
        self.shared.connect_locked(&mut state);
        drop(state);
        self.shared.bump_revision();
    }

    /// Close the stream. Idempotent.
    pub fn disconnect(&self) {
        let mut state = self.shared.state.lock();
        self.shared.disconnect_locked(&mut state);
        drop(state);
        self.shared.bump_revision();
    }

    /// Fetch every watched symbol once over REST. Returns the number of
    /// quotes applied.
    pub async fn refresh_now(&self) -> usize {
        let symbols = self.symbols();
        if symbols.is_empty() {
            return 0;
        }

        let quotes = self.shared.quotes.fetch_multiple_quotes(&symbols).await;
        let applied = quotes
            .iter()
            .filter(|(symbol, quote)| {
                matches!(self.update_price(symbol, quote), PriceUpdate::Applied { .. })
            })
            .count();

        if quotes.is_empty() {
            let mut state = self.shared.state.lock();
            state.error = Some("Failed to refresh quotes".to_string());
            drop(state);
            self.shared.bump_revision();
        }
        debug!(requested = symbols.len(), applied, "manual refresh finished");
        applied
    }

    /// Stop all background work and save the watchlist.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        self.shared.stop_polling_locked(&mut state);
        self.shared.disconnect_locked(&mut state);
        let snapshot = state.persisted();
        drop(state);
        self.shared.save(&snapshot);
    }

    pub fn stocks(&self) -> Vec<WatchedStock> {
        self.shared.state.lock().stocks.clone()
    }

    pub fn stock(&self, symbol: &str) -> Option<WatchedStock> {
        let symbol = normalize_symbol(symbol)?;
        self.shared
            .state
            .lock()
            .stocks
            .iter()
            .find(|s| s.symbol == symbol)
            .cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.shared.state.lock().symbols()
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        let state = self.shared.state.lock();
        state.connection.snapshot(&state.polling)
    }

    /// Last user-facing error, cleared by the next successful operation.
    pub fn error(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.shared.state.lock().error = None;
    }

    pub fn is_live_data_enabled(&self) -> bool {
        self.shared.state.lock().refresh.live_data_enabled
    }

    pub fn refresh_interval(&self) -> Duration {
        self.shared.state.lock().refresh.refresh_interval
    }

    /// Revision counter bumped after every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn quote_client(&self) -> &QuoteClient {
        &self.shared.quotes
    }

    fn reject(&self, state: &mut StoreState, err: StoreError) -> Result<(), StoreError> {
        warn!(error = %err, "watchlist change rejected");
        state.error = Some(err.to_string());
        self.shared.bump_revision();
        Err(err)
    }

    /// Release the lock, save the watchlist and publish the change.
    fn commit(&self, state: MutexGuard<'_, StoreState>) {
        let snapshot = state.persisted();
        drop(state);
        self.shared.save(&snapshot);
        self.shared.bump_revision();
    }
}

fn validate(symbol: &str, alert_price: Option<f64>) -> Result<String, StoreError> {
    let symbol = normalize_symbol(symbol)
        .ok_or_else(|| StoreError::InvalidInput("symbol must not be empty".to_string()))?;
    if let Some(price) = alert_price {
        if !price.is_finite() || price <= 0.0 {
            return Err(StoreError::InvalidInput(format!(
                "alert price must be a positive number, got {price}"
            )));
        }
    }
    Ok(symbol)
}
