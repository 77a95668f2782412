//! End-to-end behavior of the watchlist store against fake collaborators.

mod common;

use chrono::Utc;
use common::{Harness, advance, settle};
use std::sync::Arc;
use std::time::Duration;
use stockwatch::connection::ConnectionSettings;
use stockwatch::error::StoreError;
use stockwatch::models::{ConnectionStatus, MAX_PRICE_HISTORY, Quote};
use stockwatch::persistence::MemoryStore;
use stockwatch::store::{PriceUpdate, StoreSettings};

fn quote(symbol: &str, price: f64) -> Quote {
    Quote::from_price(symbol, price, Utc::now())
}

/// Harness with AAPL on the watchlist and the stream connected.
async fn connected() -> Harness {
    let h = Harness::new();
    h.store.add_stock("AAPL", "Apple Inc.", 150.0).unwrap();
    settle().await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Connected);
    h
}

#[tokio::test(start_paused = true)]
async fn test_alert_fires_once_per_crossing() {
    let h = Harness::offline();
    h.store.add_stock("AAPL", "Apple Inc.", 150.0).unwrap();

    assert_eq!(
        h.store.update_price("AAPL", &quote("AAPL", 149.0)),
        PriceUpdate::Applied { notified: false }
    );
    advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.store.update_price("AAPL", &quote("AAPL", 151.0)),
        PriceUpdate::Applied { notified: true }
    );
    assert!(h.store.stock("AAPL").unwrap().is_alert_triggered);

    advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.store.update_price("AAPL", &quote("AAPL", 152.0)),
        PriceUpdate::Applied { notified: false }
    );

    // Dropping back below the threshold does not re-arm the alert.
    advance(Duration::from_secs(1)).await;
    h.store.update_price("AAPL", &quote("AAPL", 140.0));
    advance(Duration::from_secs(1)).await;
    h.store.update_price("AAPL", &quote("AAPL", 155.0));
    assert_eq!(h.notifier.count(), 1);
    assert!(h.store.stock("AAPL").unwrap().is_alert_triggered);

    // Editing the alert price does.
    h.store.update_alert_price("aapl", 150.0).unwrap();
    assert!(!h.store.stock("AAPL").unwrap().is_alert_triggered);
    advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.store.update_price("AAPL", &quote("AAPL", 156.0)),
        PriceUpdate::Applied { notified: true }
    );
    assert_eq!(h.notifier.count(), 2);

    let alerts = h.notifier.alerts.lock();
    let alert = &alerts[0];
    assert_eq!(alert.symbol, "AAPL");
    assert_eq!(alert.price, 151.0);
    assert!(alert.body.contains("$151.00"));
}

#[tokio::test(start_paused = true)]
async fn test_updates_within_window_are_dropped() {
    let h = Harness::offline();
    h.store.add_stock("AAPL", "Apple Inc.", 500.0).unwrap();

    assert!(matches!(
        h.store.update_price("AAPL", &quote("AAPL", 100.0)),
        PriceUpdate::Applied { .. }
    ));
    advance(Duration::from_millis(500)).await;
    assert_eq!(
        h.store.update_price("AAPL", &quote("AAPL", 101.0)),
        PriceUpdate::Throttled
    );
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(100.0));

    advance(Duration::from_millis(500)).await;
    assert!(matches!(
        h.store.update_price("AAPL", &quote("AAPL", 102.0)),
        PriceUpdate::Applied { .. }
    ));

    let stock = h.store.stock("AAPL").unwrap();
    assert_eq!(stock.current_price, Some(102.0));
    assert_eq!(stock.price_history.len(), 2);
}

#[tokio::test]
async fn test_unknown_symbol_update_is_ignored() {
    let h = Harness::offline();
    assert_eq!(
        h.store.update_price("TSLA", &quote("TSLA", 200.0)),
        PriceUpdate::UnknownSymbol
    );
    assert!(h.store.stocks().is_empty());
}

#[tokio::test]
async fn test_price_history_is_capped() {
    let h = Harness::with_settings(StoreSettings {
        live_data_enabled: false,
        throttle_window: Duration::ZERO,
        ..StoreSettings::default()
    });
    h.store.add_stock("AAPL", "Apple Inc.", 10_000.0).unwrap();

    for i in 0..(MAX_PRICE_HISTORY + 100) {
        h.store.update_price("AAPL", &quote("AAPL", 100.0 + i as f64));
    }

    let stock = h.store.stock("AAPL").unwrap();
    assert_eq!(stock.price_history.len(), MAX_PRICE_HISTORY);
    assert_eq!(stock.price_history.front().unwrap().price, 200.0);
    assert_eq!(
        stock.price_history.back().unwrap().price,
        100.0 + (MAX_PRICE_HISTORY + 99) as f64
    );
}

#[tokio::test]
async fn test_rejected_edits_surface_in_error_field() {
    let h = Harness::offline();
    h.store.add_stock("AAPL", "", 150.0).unwrap();
    assert_eq!(h.store.stock("aapl").unwrap().name, "AAPL");

    assert_eq!(
        h.store.add_stock(" aapl ", "Apple", 120.0),
        Err(StoreError::DuplicateSymbol("AAPL".to_string()))
    );
    assert_eq!(
        h.store.error().as_deref(),
        Some("AAPL is already on the watchlist")
    );

    assert!(matches!(
        h.store.add_stock("MSFT", "Microsoft", 0.0),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        h.store.add_stock("   ", "Nothing", 10.0),
        Err(StoreError::InvalidInput(_))
    ));
    assert_eq!(
        h.store.remove_stock("TSLA"),
        Err(StoreError::UnknownSymbol("TSLA".to_string()))
    );
    assert_eq!(h.store.stocks().len(), 1);

    h.store.add_stock("MSFT", "Microsoft", 400.0).unwrap();
    assert_eq!(h.store.error(), None);
    assert_eq!(h.store.symbols(), vec!["AAPL".to_string(), "MSFT".to_string()]);
}

#[tokio::test]
async fn test_mutations_bump_revision() {
    let h = Harness::offline();
    let mut revisions = h.store.subscribe();
    assert!(!revisions.has_changed().unwrap());

    h.store.add_stock("AAPL", "Apple Inc.", 150.0).unwrap();
    assert!(revisions.has_changed().unwrap());
    let _ = revisions.borrow_and_update();

    h.store.update_price("AAPL", &quote("AAPL", 149.0));
    assert!(revisions.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_stream_trades_update_prices() {
    let h = connected().await;

    h.transport.send_trade("AAPL", 151.0);
    settle().await;

    let stock = h.store.stock("AAPL").unwrap();
    assert_eq!(stock.current_price, Some(151.0));
    assert!(!stock.is_loading);
    assert_eq!(h.notifier.count(), 1);

    // Throttled, then accepted after the window.
    h.transport.send_trade("AAPL", 152.0);
    settle().await;
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(151.0));

    advance(Duration::from_secs(1)).await;
    h.transport.send_trade("aapl", 153.0);
    settle().await;
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(153.0));
    assert_eq!(h.notifier.count(), 1);

    // Unknown symbols and malformed messages leave the stream up.
    h.transport.send_trade("TSLA", 999.0);
    h.transport.send("{\"type\":\"heartbeat\"}");
    h.transport.send("{\"type\":\"connected\",\"symbols\":[\"AAPL\"]}");
    settle().await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Connected);
    assert!(h.store.stock("TSLA").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_no_polling_while_connected() {
    let h = connected().await;
    h.api.set_price("AAPL", 151.0);

    advance(Duration::from_secs(120)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Connected);
    assert!(!conn.polling_active);
    assert_eq!(h.api.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_backs_off_and_recovers() {
    let h = connected().await;

    h.transport.set_fail_open(true);
    h.transport.fail_stream("connection reset");
    settle().await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert_eq!(conn.connection_attempts, 1);
    assert_eq!(conn.reconnect_delay, Some(Duration::from_secs(2)));
    assert!(conn.polling_active);
    assert_eq!(conn.polling_interval, Some(Duration::from_secs(30)));
    assert!(h.store.error().unwrap().starts_with("Live connection lost"));

    // Reconnect attempt keeps failing until the connect timeout.
    advance(Duration::from_secs(2)).await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Connecting);
    advance(Duration::from_secs(15)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert_eq!(conn.connection_attempts, 2);
    assert_eq!(conn.reconnect_delay, Some(Duration::from_secs(4)));

    h.transport.set_fail_open(false);
    advance(Duration::from_secs(4)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Connected);
    assert_eq!(conn.connection_attempts, 0);
    assert!(!conn.polling_active);
    assert_eq!(h.store.error(), None);
    assert_eq!(h.transport.opened().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_message_drops_connection() {
    let h = connected().await;

    h.transport.send("{\"type\":\"error\",\"message\":\"upstream down\"}");
    settle().await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert!(conn.last_error.unwrap().contains("upstream down"));
    assert!(conn.polling_active);
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_for_empty_watchlist() {
    let h = connected().await;

    h.transport.fail_stream("connection reset");
    settle().await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Error);

    h.store.remove_stock("AAPL").unwrap();
    let attempts = h.transport.attempts();

    advance(Duration::from_secs(120)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Disconnected);
    assert!(!conn.polling_active);
    assert_eq!(conn.reconnect_delay, None);
    assert_eq!(h.transport.attempts(), attempts);
    assert_eq!(h.api.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_falls_back_to_polling() {
    let h = Harness::with_settings(StoreSettings {
        connection: ConnectionSettings {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            ..ConnectionSettings::default()
        },
        ..StoreSettings::default()
    });
    h.api.set_price("AAPL", 151.0);
    h.transport.set_hang_open(true);

    h.store.add_stock("AAPL", "Apple Inc.", 200.0).unwrap();
    settle().await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Connecting);

    advance(Duration::from_secs(15)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert_eq!(conn.reconnect_delay, Some(Duration::from_secs(120)));
    assert!(conn.polling_active);
    assert_eq!(
        h.store.error().as_deref(),
        Some("Live connection timed out after 15s")
    );

    // First poll one interval after the fallback started.
    advance(Duration::from_secs(29)).await;
    assert_eq!(h.api.calls("AAPL"), 0);
    advance(Duration::from_secs(1)).await;
    assert_eq!(h.api.calls("AAPL"), 1);
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(151.0));

    // The scheduled reconnect succeeds and polling stops.
    h.transport.set_hang_open(false);
    advance(Duration::from_secs(90)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Connected);
    assert!(!conn.polling_active);

    let calls = h.api.total_calls();
    advance(Duration::from_secs(120)).await;
    assert_eq!(h.api.total_calls(), calls);
}

/// Settings whose reconnects stay out of the way of a polling scenario.
fn slow_reconnect() -> StoreSettings {
    StoreSettings {
        connection: ConnectionSettings {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            ..ConnectionSettings::default()
        },
        ..StoreSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_edits_while_connecting_keep_connect_deadline() {
    let h = Harness::with_settings(slow_reconnect());
    h.transport.set_hang_open(true);

    h.store.add_stock("AAPL", "Apple Inc.", 200.0).unwrap();
    settle().await;
    advance(Duration::from_secs(10)).await;

    h.store.add_stock("MSFT", "Microsoft", 400.0).unwrap();
    advance(Duration::from_secs(1)).await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.store.connection().status, ConnectionStatus::Connecting);

    advance(Duration::from_secs(4)).await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert!(conn.polling_active);
    assert_eq!(
        h.store.error().as_deref(),
        Some("Live connection timed out after 15s")
    );
}

#[tokio::test(start_paused = true)]
async fn test_polling_follows_interval_change_and_skips_failures() {
    let h = Harness::with_settings(slow_reconnect());
    h.api.set_price("AAPL", 151.0);
    h.api.fail("BAD");
    h.transport.set_hang_open(true);

    h.store.add_stock("AAPL", "Apple Inc.", 200.0).unwrap();
    h.store.add_stock("BAD", "Broken", 10.0).unwrap();
    settle().await;
    advance(Duration::from_secs(15)).await;
    assert_eq!(h.store.connection().polling_interval, Some(Duration::from_secs(30)));

    h.store.set_refresh_interval(Duration::from_secs(90));
    assert_eq!(h.store.connection().polling_interval, Some(Duration::from_secs(90)));

    // The new cadence counts from the change, not from the task's first poll.
    tokio::time::advance(Duration::from_secs(90)).await;
    settle().await;
    assert_eq!(h.api.calls("AAPL"), 1);
    assert_eq!(h.api.calls("BAD"), 1);
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(151.0));

    h.api.set_price("AAPL", 152.5);
    advance(Duration::from_secs(89)).await;
    assert_eq!(h.api.calls("AAPL"), 1);
    advance(Duration::from_secs(1)).await;

    assert_eq!(h.api.calls("AAPL"), 2);
    assert_eq!(h.api.calls("BAD"), 2);
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(152.5));
    assert_eq!(h.store.stock("BAD").unwrap().current_price, None);
    assert!(h.store.connection().polling_active);
}

#[tokio::test(start_paused = true)]
async fn test_disabling_live_data_ignores_late_messages() {
    let h = connected().await;

    h.store.set_live_data_enabled(false);
    h.transport.send_trade("AAPL", 151.0);
    settle().await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Disconnected);
    assert!(!conn.polling_active);
    assert_eq!(h.store.stock("AAPL").unwrap().current_price, None);

    advance(Duration::from_secs(120)).await;
    assert_eq!(h.api.total_calls(), 0);
    assert_eq!(h.transport.attempts(), 1);

    h.store.set_live_data_enabled(true);
    settle().await;
    assert_eq!(h.store.connection().status, ConnectionStatus::Connected);
    assert_eq!(h.transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_watchlist_edits_resubscribe_after_debounce() {
    let h = connected().await;

    h.store.add_stock("MSFT", "Microsoft", 400.0).unwrap();
    advance(Duration::from_millis(100)).await;
    h.store.add_stock("goog", "Alphabet", 150.0).unwrap();
    advance(Duration::from_millis(200)).await;
    assert_eq!(h.transport.opened().len(), 1);

    advance(Duration::from_millis(60)).await;

    let opened = h.transport.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(
        opened[1],
        vec!["AAPL".to_string(), "MSFT".to_string(), "GOOG".to_string()]
    );
    assert_eq!(h.store.connection().status, ConnectionStatus::Connected);

    // Trades from the replaced stream no longer apply; the new one does.
    h.transport.send_trade("GOOG", 151.0);
    settle().await;
    assert_eq!(h.store.stock("GOOG").unwrap().current_price, Some(151.0));
}

#[tokio::test]
async fn test_connect_without_symbols_is_a_no_op() {
    let h = Harness::new();
    h.store.connect();
    settle().await;

    let conn = h.store.connection();
    assert_eq!(conn.status, ConnectionStatus::Disconnected);
    assert_eq!(conn.connection_attempts, 0);
    assert_eq!(h.transport.attempts(), 0);
}

#[tokio::test]
async fn test_watchlist_survives_restart() {
    let storage = Arc::new(MemoryStore::new());
    let offline = StoreSettings {
        live_data_enabled: false,
        ..StoreSettings::default()
    };

    let first = Harness::with_storage(offline.clone(), storage.clone());
    first.store.add_stock("AAPL", "Apple Inc.", 150.0).unwrap();
    first.store.add_stock("MSFT", "Microsoft", 400.0).unwrap();
    first.store.update_alert_price("MSFT", 420.0).unwrap();
    first.store.set_refresh_interval(Duration::from_secs(45));
    let aapl_id = first.store.stock("AAPL").unwrap().id;
    first.store.shutdown();

    let second = Harness::with_storage(offline, storage);
    let stocks = second.store.stocks();
    assert_eq!(stocks.len(), 2);
    assert_eq!(stocks[0].id, aapl_id);
    assert_eq!(stocks[1].alert_price, 420.0);
    assert_eq!(second.store.refresh_interval(), Duration::from_secs(45));
    assert!(!second.store.is_live_data_enabled());
}

#[tokio::test]
async fn test_refresh_now_skips_failed_symbols() {
    let h = Harness::offline();
    h.api.set_price("AAPL", 151.0);
    h.api.fail("BAD");
    h.store.add_stock("AAPL", "Apple Inc.", 150.0).unwrap();
    h.store.add_stock("BAD", "Broken", 10.0).unwrap();

    assert_eq!(h.store.refresh_now().await, 1);

    assert_eq!(h.store.stock("AAPL").unwrap().current_price, Some(151.0));
    let bad = h.store.stock("BAD").unwrap();
    assert_eq!(bad.current_price, None);
    assert!(bad.is_loading);
    assert_eq!(h.store.error(), None);
    assert_eq!(h.notifier.count(), 1);
}
