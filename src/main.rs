//! stockwatch - stock watchlist with live prices and price alerts.

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use stockwatch::api::HttpQuoteApi;
use stockwatch::cli::{Args, Command};
use stockwatch::config::{self, Config};
use stockwatch::logging::init_logging;
use stockwatch::models::ConnectionStatus;
use stockwatch::notifier::{BellNotifier, CompositeNotifier, LogNotifier, Notifier};
use stockwatch::persistence::{FileStore, KeyValueStore};
use stockwatch::polling::polling_interval;
use stockwatch::render::{render_symbols, render_watchlist};
use stockwatch::store::{StoreDeps, WatchlistStore};
use stockwatch::stream::SseTransport;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum spacing between two redraws of the table.
const REDRAW_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    init_logging(args.verbose, args.log_json)?;

    let mut config = if let Some(ref path) = args.config {
        Config::load(path)?
    } else {
        Config::load_or_default()
    };
    apply_overrides(&mut config, &args);

    let api = HttpQuoteApi::new(&config.general.api_url, config.general.timeout)?;
    debug!(api_url = api.base_url(), "quote service");

    match args.command() {
        Command::Search { query } => {
            let results = api
                .search_symbols(&query)
                .await
                .with_context(|| format!("Symbol search for {query:?} failed"))?;
            print!("{}", render_symbols(&results));
            Ok(())
        }
        Command::Symbols {
            exchange,
            page,
            limit,
        } => {
            let results = api
                .list_symbols(&exchange, page, limit)
                .await
                .with_context(|| format!("Listing symbols of {exchange} failed"))?;
            print!("{}", render_symbols(&results));
            Ok(())
        }
        Command::Watch => run_watch(&args, &config, api).await,
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ref url) = args.api_url {
        config.general.api_url = url.clone();
    }
    if let Some(timeout) = args.timeout {
        config.general.timeout = Duration::from_secs(timeout);
    }
    if let Some(interval) = args.interval {
        config.general.refresh_interval = interval;
    }
    if args.no_live {
        config.general.live_data = false;
    }
}

fn open_storage(args: &Args) -> Option<Arc<dyn KeyValueStore>> {
    if args.no_persist {
        return None;
    }
    let path = args.state_file.clone().or_else(FileStore::default_path)?;
    match FileStore::open(&path) {
        Ok(store) => {
            info!(path = %store.path().display(), "using saved watchlist file");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open saved watchlist, not persisting");
            None
        }
    }
}

fn build_notifier(args: &Args) -> Arc<dyn Notifier> {
    let mut notifier = CompositeNotifier::new().with(Arc::new(LogNotifier));
    if let Some(pattern) = args.bell {
        notifier = notifier.with(Arc::new(BellNotifier::new(pattern.into())));
    }
    Arc::new(notifier)
}

/// Put the command-line and configured symbols on the watchlist.
fn seed_watchlist(store: &WatchlistStore, args: &Args, config: &Config) {
    if let Some(ref specs) = args.symbols {
        for spec in specs {
            let result = if store.stock(&spec.symbol).is_some() {
                store.update_alert_price(&spec.symbol, spec.alert_price)
            } else {
                store.add_stock(&spec.symbol, "", spec.alert_price)
            };
            if let Err(e) = result {
                warn!(symbol = %spec.symbol, error = %e, "skipping command-line symbol");
            }
        }
    } else if store.symbols().is_empty() {
        for entry in &config.watchlist {
            let name = entry.name.as_deref().unwrap_or("");
            if let Err(e) = store.add_stock(&entry.symbol, name, entry.alert_price) {
                warn!(symbol = %entry.symbol, error = %e, "skipping configured symbol");
            }
        }
    }
    store.clear_error();
}

async fn run_watch(args: &Args, config: &Config, api: HttpQuoteApi) -> Result<()> {
    let transport = SseTransport::new(&config.general.api_url, config.stream.connect_timeout)?;
    let store = WatchlistStore::new(
        StoreDeps {
            api: Arc::new(api),
            transport: Arc::new(transport),
            notifier: build_notifier(args),
            storage: open_storage(args),
        },
        config.store_settings(),
    );

    // The command line wins over a saved preference.
    if args.no_live && store.is_live_data_enabled() {
        store.set_live_data_enabled(false);
    }
    if let Some(interval) = args.interval {
        store.set_refresh_interval(interval);
    }

    seed_watchlist(&store, args, config);

    if store.symbols().is_empty() {
        eprintln!("Error: No symbols to watch.");
        eprintln!("Provide symbols via -s flag or config file.");
        eprintln!();
        eprintln!("Example: stockwatch -s AAPL:200,MSFT:450");
        eprintln!();
        eprintln!("Or create a config file at {:?}", Config::default_config_path());
        eprintln!();
        eprintln!("Sample config:");
        eprintln!("{}", config::sample_config());
        std::process::exit(1);
    }

    let applied = store.refresh_now().await;
    info!(applied, symbols = store.symbols().len(), "initial quotes loaded");

    let result = if store.is_live_data_enabled() {
        if store.connection().status == ConnectionStatus::Disconnected {
            store.connect();
        }
        run_live(&store, args.iterations).await
    } else {
        run_batch(&store, args.iterations).await
    };

    store.shutdown();
    result
}

fn draw(store: &WatchlistStore) {
    print!(
        "{}",
        render_watchlist(
            &store.stocks(),
            &store.connection(),
            store.error().as_deref(),
            Local::now()
        )
    );
}

/// Redraw whenever the store changes, at most once per [`REDRAW_INTERVAL`].
async fn run_live(store: &WatchlistStore, iterations: u64) -> Result<()> {
    let mut revisions = store.subscribe();
    let mut redraws = 0u64;

    loop {
        let _ = revisions.borrow_and_update();
        draw(store);
        let drawn_at = Instant::now();
        redraws += 1;
        if iterations > 0 && redraws >= iterations {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep_until(drawn_at + REDRAW_INTERVAL) => {}
        }
    }
}

/// Poll over REST on the fallback cadence without the live stream.
async fn run_batch(store: &WatchlistStore, iterations: u64) -> Result<()> {
    let mut redraws = 0u64;

    loop {
        draw(store);
        redraws += 1;
        if iterations > 0 && redraws >= iterations {
            return Ok(());
        }

        let interval = polling_interval(store.refresh_interval(), store.symbols().len());
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
        store.refresh_now().await;
    }
}
