//! Streaming connection manager.
//!
//! Owns the single price stream and its lifecycle:
//!
//! ```text
//! disconnected -> connecting -> connected
//!                 connecting -> error        (timeout)
//!                 connected  -> error        (transport error)
//!                 error      -> connecting   (scheduled reconnect)
//! any state      -> disconnected             (live data off / empty watchlist)
//! ```
//!
//! Every opened stream gets a new epoch. Reader tasks and timers carry the
//! epoch they were created for and do nothing once it is no longer current,
//! so late events from a superseded connection are dropped.

use crate::api::timestamp_from_epoch;
use crate::error::StreamError;
use crate::models::{ConnectionStatus, Quote, normalize_symbol};
use crate::polling::{PollingState, polling_interval};
use crate::store::{PriceUpdate, Shared, StoreState};
use crate::stream::{StreamMessage, TradeData, decode_message};
use chrono::Utc;
use futures::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timing knobs for the streaming connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Give up on a connection still `connecting` after this long.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubled per consecutive failure.
    pub backoff_base: Duration,
    /// Upper bound for the reconnect delay.
    pub backoff_max: Duration,
    /// Quiet period before reopening the stream after a watchlist edit.
    pub resubscribe_debounce: Duration,
    /// Pause between open attempts while still `connecting`.
    pub open_retry_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            resubscribe_debounce: Duration::from_millis(250),
            open_retry_delay: Duration::from_secs(3),
        }
    }
}

/// `min(base * 2^attempts, max)`.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempts.min(16);
    base.saturating_mul(factor).min(max)
}

/// Read-only view of the connection for consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    pub polling_active: bool,
    pub polling_interval: Option<Duration>,
    /// Delay of the pending reconnect, if one is scheduled.
    pub reconnect_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) status: ConnectionStatus,
    attempts: u32,
    last_error: Option<String>,
    epoch: u64,
    reader: Option<AbortHandle>,
    timeout_timer: Option<AbortHandle>,
    /// When the current `connecting` phase gives up. Survives resubscribes.
    connect_deadline: Option<Instant>,
    reconnect_timer: Option<AbortHandle>,
    reconnect_delay: Option<Duration>,
    resubscribe_timer: Option<AbortHandle>,
}

impl ConnectionState {
    pub(crate) fn snapshot(&self, polling: &PollingState) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            connection_attempts: self.attempts,
            last_error: self.last_error.clone(),
            polling_active: polling.is_active(),
            polling_interval: polling.interval,
            reconnect_delay: self.reconnect_delay,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.reader.is_some()
    }

    /// Drop the active stream and its timeout. Invalidates the epoch.
    fn close_stream(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(timer) = self.timeout_timer.take() {
            timer.abort();
        }
        self.epoch += 1;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.reconnect_delay = None;
    }

    fn cancel_resubscribe(&mut self) {
        if let Some(timer) = self.resubscribe_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn abort_all(&mut self) {
        self.close_stream();
        self.cancel_reconnect();
        self.cancel_resubscribe();
    }
}

impl Shared {
    /// Open the stream for the current symbol set unless live data is off,
    /// the watchlist is empty, or the stream is already connected.
    pub(crate) fn connect_locked(self: &Arc<Self>, state: &mut StoreState) {
        self.open_stream_locked(state, None);
    }

    /// Like [`connect_locked`](Self::connect_locked), but a pending
    /// `deadline` is kept instead of arming a fresh connect timeout.
    fn open_stream_locked(self: &Arc<Self>, state: &mut StoreState, deadline: Option<Instant>) {
        if !state.refresh.live_data_enabled {
            debug!("live data disabled, not connecting");
            return;
        }
        let symbols = state.symbols();
        if symbols.is_empty() {
            debug!("no watched symbols, not connecting");
            return;
        }
        if state.connection.status == ConnectionStatus::Connected {
            debug!("stream already connected");
            return;
        }

        let conn = &mut state.connection;
        conn.close_stream();
        conn.cancel_reconnect();
        conn.status = ConnectionStatus::Connecting;
        let epoch = conn.epoch;

        info!(symbols = %symbols.join(","), epoch, "opening price stream");

        let reader = tokio::spawn(run_stream(Arc::downgrade(self), epoch, symbols));
        conn.reader = Some(reader.abort_handle());

        let deadline =
            deadline.unwrap_or_else(|| Instant::now() + self.settings.connection.connect_timeout);
        conn.connect_deadline = Some(deadline);
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_connect_timeout(epoch);
            }
        });
        conn.timeout_timer = Some(timer.abort_handle());
    }

    /// Close the stream and cancel pending reconnects. Idempotent.
    pub(crate) fn disconnect_locked(&self, state: &mut StoreState) {
        let conn = &mut state.connection;
        let was = conn.status;
        conn.abort_all();
        conn.status = ConnectionStatus::Disconnected;
        if was != ConnectionStatus::Disconnected {
            info!(previous = %was, "price stream disconnected");
        }
    }

    /// React to a watchlist edit: reopen with the new symbol set after a
    /// debounce, or disconnect when nothing is left to watch.
    pub(crate) fn symbols_changed_locked(self: &Arc<Self>, state: &mut StoreState) {
        if state.stocks.is_empty() {
            self.disconnect_locked(state);
            self.stop_polling_locked(state);
            return;
        }
        if !state.refresh.live_data_enabled {
            return;
        }

        match state.connection.status {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                state.connection.cancel_resubscribe();
                let weak = Arc::downgrade(self);
                let debounce = self.settings.connection.resubscribe_debounce;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.on_resubscribe_timer();
                    }
                });
                state.connection.resubscribe_timer = Some(timer.abort_handle());
            }
            ConnectionStatus::Disconnected => self.connect_locked(state),
            // A reconnect is already scheduled and polling reads the live list,
            // only the cadence may need to follow the new symbol count.
            ConnectionStatus::Error => {
                let interval =
                    polling_interval(state.refresh.refresh_interval, state.stocks.len());
                if state.polling.is_active() && state.polling.interval != Some(interval) {
                    self.start_polling_locked(state);
                }
            }
        }
    }

    fn on_resubscribe_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.connection.resubscribe_timer = None;
        if !state.refresh.live_data_enabled || state.stocks.is_empty() {
            return;
        }
        if !matches!(
            state.connection.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return;
        }

        debug!("watchlist changed, reopening price stream");
        let deadline = match state.connection.status {
            ConnectionStatus::Connecting => state.connection.connect_deadline,
            _ => None,
        };
        state.connection.close_stream();
        state.connection.status = ConnectionStatus::Disconnected;
        self.open_stream_locked(&mut state, deadline);
        drop(state);
        self.bump_revision();
    }

    fn on_stream_open(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            return false;
        }

        let conn = &mut state.connection;
        conn.status = ConnectionStatus::Connected;
        conn.attempts = 0;
        conn.last_error = None;
        conn.cancel_reconnect();
        conn.connect_deadline = None;
        if let Some(timer) = conn.timeout_timer.take() {
            timer.abort();
        }
        info!(epoch, "price stream connected");

        self.stop_polling_locked(&mut state);
        state.error = None;
        drop(state);
        self.bump_revision();
        true
    }

    /// Returns `true` when another open attempt should be made.
    fn on_open_failed(&self, epoch: u64, err: &StreamError) -> bool {
        let mut state = self.state.lock();
        if !state.connection.is_current(epoch)
            || state.connection.status != ConnectionStatus::Connecting
        {
            return false;
        }

        // Not escalated: the connect timeout decides when to give up.
        warn!(epoch, error = %err, "price stream open failed, retrying");
        state.connection.last_error = Some(err.to_string());
        true
    }

    fn on_connect_timeout(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state.lock();
        if !state.connection.is_current(epoch)
            || state.connection.status != ConnectionStatus::Connecting
        {
            return;
        }

        let timeout = self.settings.connection.connect_timeout;
        let reason = format!(
            "Live connection timed out after {}",
            humantime::format_duration(timeout)
        );
        warn!(epoch, timeout_ms = timeout.as_millis() as u64, "price stream connect timed out");

        state.connection.close_stream();
        state.connection.status = ConnectionStatus::Error;
        state.connection.last_error = Some(reason.clone());
        state.error = Some(reason);

        self.ensure_polling_locked(&mut state);
        self.schedule_reconnect_locked(&mut state);
        drop(state);
        self.bump_revision();
    }

    fn on_stream_error(self: &Arc<Self>, epoch: u64, err: StreamError) {
        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            return;
        }

        warn!(epoch, error = %err, "price stream failed");
        state.connection.close_stream();
        state.connection.status = ConnectionStatus::Error;
        state.connection.last_error = Some(err.to_string());
        state.error = Some(format!("Live connection lost: {err}"));

        self.ensure_polling_locked(&mut state);
        self.schedule_reconnect_locked(&mut state);
        drop(state);
        self.bump_revision();
    }

    /// Fall back to polling, keeping the cadence of a poll timer that is
    /// already running across repeated failures.
    fn ensure_polling_locked(self: &Arc<Self>, state: &mut StoreState) {
        if !state.polling.is_active() {
            self.start_polling_locked(state);
        }
    }

    fn schedule_reconnect_locked(self: &Arc<Self>, state: &mut StoreState) {
        state.connection.cancel_reconnect();
        if state.stocks.is_empty() || !state.refresh.live_data_enabled {
            debug!("nothing to stream, not scheduling reconnect");
            return;
        }

        let settings = &self.settings.connection;
        let conn = &mut state.connection;
        conn.attempts += 1;
        let delay = backoff_delay(conn.attempts, settings.backoff_base, settings.backoff_max);
        info!(
            attempt = conn.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling price stream reconnect"
        );

        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_reconnect_timer();
            }
        });
        conn.reconnect_timer = Some(timer.abort_handle());
        conn.reconnect_delay = Some(delay);
    }

    fn on_reconnect_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.connection.reconnect_timer = None;
        state.connection.reconnect_delay = None;

        if state.stocks.is_empty() {
            debug!("skipping reconnect: no watched symbols");
            return;
        }
        if matches!(
            state.connection.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            debug!(status = %state.connection.status, "skipping reconnect: stream already active");
            return;
        }

        self.connect_locked(&mut state);
        drop(state);
        self.bump_revision();
    }

    /// Apply a trade tick if `epoch` is still the live connection.
    fn apply_trade(&self, epoch: u64, trade: &TradeData) -> bool {
        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            return false;
        }

        let Some(symbol) = normalize_symbol(&trade.symbol) else {
            warn!("discarding trade without symbol");
            return true;
        };
        let previous_close = state
            .stocks
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(|s| s.previous_close);
        let quote = quote_from_trade(&symbol, trade, previous_close);

        let (update, notification) = self.update_price_locked(&mut state, &symbol, &quote);
        drop(state);

        if update == PriceUpdate::UnknownSymbol {
            debug!(%symbol, "trade for unwatched symbol");
        }
        self.finish_price_update(update, notification);
        true
    }
}

/// Turn a trade tick into a quote, deriving change figures against the
/// stock's last known previous close when the tick omits them.
pub(crate) fn quote_from_trade(symbol: &str, trade: &TradeData, previous_close: Option<f64>) -> Quote {
    let timestamp = trade
        .timestamp
        .and_then(timestamp_from_epoch)
        .unwrap_or_else(Utc::now);
    let mut quote = Quote::from_price(symbol, trade.price, timestamp);

    let base = previous_close.filter(|close| *close != 0.0);
    quote.change = trade
        .change
        .or_else(|| base.map(|close| trade.price - close));
    quote.percent_change = trade
        .percent_change
        .or_else(|| base.map(|close| (trade.price - close) / close * 100.0));
    quote
}

/// Reader task for one stream epoch.
async fn run_stream(shared: Weak<Shared>, epoch: u64, symbols: Vec<String>) {
    loop {
        let Some(transport) = shared.upgrade().map(|s| Arc::clone(&s.transport)) else {
            return;
        };

        match transport.open(&symbols).await {
            Ok(mut events) => {
                match shared.upgrade() {
                    Some(s) if s.on_stream_open(epoch) => {}
                    _ => return,
                }

                while let Some(event) = events.next().await {
                    let Some(s) = shared.upgrade() else {
                        return;
                    };
                    let data = match event {
                        Ok(data) => data,
                        Err(err) => {
                            s.on_stream_error(epoch, err);
                            return;
                        }
                    };

                    match decode_message(&data) {
                        Ok(StreamMessage::Trade { data: trade }) => {
                            if !s.apply_trade(epoch, &trade) {
                                return;
                            }
                        }
                        Ok(StreamMessage::Connected { message, symbols }) => {
                            info!(
                                epoch,
                                message = message.as_deref().unwrap_or(""),
                                symbols = %symbols.join(","),
                                "stream subscription confirmed"
                            );
                        }
                        Ok(StreamMessage::Error { message }) => {
                            let message = message.unwrap_or_else(|| "unknown error".to_string());
                            s.on_stream_error(epoch, StreamError::Server(message));
                            return;
                        }
                        Err(err) => warn!(epoch, error = %err, "discarding malformed stream message"),
                    }
                }

                if let Some(s) = shared.upgrade() {
                    s.on_stream_error(epoch, StreamError::Closed);
                }
                return;
            }
            Err(err) => {
                let retry = match shared.upgrade() {
                    Some(s) if s.on_open_failed(epoch, &err) => s.settings.connection.open_retry_delay,
                    _ => return,
                };
                tokio::time::sleep(retry).await;
            }
        }
    }
}
