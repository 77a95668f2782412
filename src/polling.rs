//! REST polling fallback, active only while the stream is not connected.

use crate::models::ConnectionStatus;
use crate::store::{Shared, StoreState};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Polling never runs faster than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Rate budget per watched symbol and tick.
pub const PER_SYMBOL_INTERVAL: Duration = Duration::from_secs(1);

/// `max(configured, max(symbols * 1s, 30s))`.
pub fn polling_interval(configured: Duration, symbol_count: usize) -> Duration {
    let scaled = PER_SYMBOL_INTERVAL.saturating_mul(u32::try_from(symbol_count).unwrap_or(u32::MAX));
    configured.max(scaled.max(MIN_POLL_INTERVAL))
}

#[derive(Debug, Default)]
pub(crate) struct PollingState {
    epoch: u64,
    timer: Option<AbortHandle>,
    pub(crate) interval: Option<Duration>,
}

impl PollingState {
    pub(crate) fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn abort(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.interval = None;
        self.epoch += 1;
    }
}

impl Shared {
    /// Start (or restart) the polling timer. No-op while live data is off or
    /// the stream is connected.
    pub(crate) fn start_polling_locked(self: &Arc<Self>, state: &mut StoreState) {
        if !state.refresh.live_data_enabled {
            debug!("live data disabled, not polling");
            return;
        }
        if state.connection.status == ConnectionStatus::Connected {
            debug!("stream connected, not polling");
            return;
        }

        state.polling.abort();
        let epoch = state.polling.epoch;
        let interval = polling_interval(state.refresh.refresh_interval, state.stocks.len());
        info!(
            interval_ms = interval.as_millis() as u64,
            symbols = state.stocks.len(),
            "starting polling fallback"
        );

        let first_tick = Instant::now() + interval;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.poll_once(epoch).await {
                    return;
                }
            }
        });

        state.polling.timer = Some(task.abort_handle());
        state.polling.interval = Some(interval);
    }

    /// Clear the polling timer. Idempotent.
    pub(crate) fn stop_polling_locked(&self, state: &mut StoreState) {
        if state.polling.is_active() {
            info!("stopping polling fallback");
        }
        state.polling.abort();
    }

    /// One polling tick. Returns `false` once this poll epoch is over.
    async fn poll_once(self: &Arc<Self>, epoch: u64) -> bool {
        let symbols = {
            let mut state = self.state.lock();
            if state.polling.epoch != epoch {
                return false;
            }
            if state.connection.status == ConnectionStatus::Connected {
                debug!("stream connected since last tick");
                self.stop_polling_locked(&mut state);
                return false;
            }
            state.symbols()
        };

        debug!(count = symbols.len(), "polling quotes");
        let results = join_all(symbols.iter().map(|symbol| self.quotes.fetch_quote(symbol))).await;

        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(quote) => {
                    let (update, notification) = {
                        let mut state = self.state.lock();
                        if state.polling.epoch != epoch || !state.refresh.live_data_enabled {
                            debug!(%symbol, "dropping quote from superseded poll");
                            return false;
                        }
                        self.update_price_locked(&mut state, symbol, &quote)
                    };
                    self.finish_price_update(update, notification);
                }
                Err(err) => warn!(%symbol, error = %err, "polling quote failed"),
            }
        }

        true
    }
}
