//! stockwatch - stock watchlist engine with live prices and price alerts.
//!
//! [`store::WatchlistStore`] is the entry point: it keeps the watchlist,
//! reconciles streamed and polled prices into it and fires alerts.

pub mod alert;
pub mod api;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod models;
pub mod notifier;
pub mod persistence;
pub mod polling;
pub mod quote_client;
pub mod render;
pub mod store;
pub mod stream;

pub use error::{PersistenceError, QuoteError, StoreError, StreamError};
pub use models::{ConnectionStatus, Quote, WatchedStock};
pub use store::{PriceUpdate, StoreDeps, StoreSettings, WatchlistStore};
