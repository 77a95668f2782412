//! Persisted watchlist state.
//!
//! Only the watchlist, the refresh interval and the live-data switch are
//! saved. Snapshots are versioned; [`migrate`] accepts any older or partial
//! snapshot and fills in safe defaults.

use crate::error::PersistenceError;
use crate::models::{
    MAX_PRICE_HISTORY, PricePoint, WatchedStock, new_stock_id, normalize_symbol,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const STATE_KEY: &str = "stockwatch-state";
pub const STATE_VERSION: u32 = 2;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// String key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub watched_stocks: Vec<WatchedStock>,
    /// Milliseconds.
    pub refresh_time_interval: u64,
    pub is_live_data_enabled: bool,
}

impl PersistedState {
    pub fn capture(stocks: &[WatchedStock], refresh_interval: Duration, live_data_enabled: bool) -> Self {
        Self {
            version: STATE_VERSION,
            watched_stocks: stocks.to_vec(),
            refresh_time_interval: refresh_interval.as_millis() as u64,
            is_live_data_enabled: live_data_enabled,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_time_interval)
    }
}

/// Read and migrate the saved state, if any.
pub fn load(store: &dyn KeyValueStore) -> Result<Option<PersistedState>, PersistenceError> {
    match store.get(STATE_KEY)? {
        Some(raw) => Ok(Some(migrate(&raw)?)),
        None => Ok(None),
    }
}

pub fn save(store: &dyn KeyValueStore, state: &PersistedState) -> Result<(), PersistenceError> {
    let raw = serde_json::to_string(state)?;
    store.set(STATE_KEY, &raw)
}

/// Bring a snapshot of any version up to [`STATE_VERSION`].
pub fn migrate(raw: &str) -> Result<PersistedState, PersistenceError> {
    let value: Value = serde_json::from_str(raw)?;

    let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version > u64::from(STATE_VERSION) {
        warn!(version, "saved state is newer than this build, reading what is understood");
    }

    let refresh_time_interval = value
        .get("refreshTimeInterval")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_REFRESH_INTERVAL.as_millis() as u64);

    let is_live_data_enabled = value
        .get("isLiveDataEnabled")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut watched_stocks: Vec<WatchedStock> = Vec::new();
    for entry in value
        .get("watchedStocks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match migrate_stock(entry) {
            Some(stock) if watched_stocks.iter().any(|s| s.symbol == stock.symbol) => {
                warn!(symbol = %stock.symbol, "dropping duplicate saved stock");
            }
            Some(stock) => watched_stocks.push(stock),
            None => warn!("dropping saved stock without symbol or alert price"),
        }
    }

    Ok(PersistedState {
        version: STATE_VERSION,
        watched_stocks,
        refresh_time_interval,
        is_live_data_enabled,
    })
}

fn migrate_stock(entry: &Value) -> Option<WatchedStock> {
    let symbol = normalize_symbol(entry.get("symbol")?.as_str()?)?;
    let alert_price = entry
        .get("alertPrice")
        .and_then(Value::as_f64)
        .filter(|p| p.is_finite() && *p > 0.0)?;

    let text = |field: &str| {
        entry
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let number = |field: &str| entry.get(field).and_then(Value::as_f64).filter(|v| v.is_finite());

    let mut price_history: VecDeque<PricePoint> = entry
        .get("priceHistory")
        .cloned()
        .and_then(|h| serde_json::from_value(h).ok())
        .unwrap_or_default();
    while price_history.len() > MAX_PRICE_HISTORY {
        price_history.pop_front();
    }

    let current_price = number("currentPrice");
    Some(WatchedStock {
        id: text("id").unwrap_or_else(new_stock_id),
        name: text("name").unwrap_or_else(|| symbol.clone()),
        symbol,
        alert_price,
        current_price,
        change: number("change"),
        percent_change: number("percentChange"),
        high: number("high"),
        low: number("low"),
        open: number("open"),
        previous_close: number("previousClose"),
        price_history,
        is_loading: current_price.is_none(),
        last_updated: entry
            .get("lastUpdated")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok()),
        is_alert_triggered: entry
            .get("isAlertTriggered")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Key-value map persisted as one JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Default state file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("stockwatch").join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrate_fills_defaults() {
        let state = migrate(r#"{"watchedStocks":[{"symbol":"aapl","alertPrice":150}]}"#).unwrap();

        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.refresh_interval(), DEFAULT_REFRESH_INTERVAL);
        assert!(state.is_live_data_enabled);

        let stock = &state.watched_stocks[0];
        assert_eq!(stock.symbol, "AAPL");
        assert_eq!(stock.name, "AAPL");
        assert_eq!(stock.alert_price, 150.0);
        assert!(stock.is_loading);
        assert!(!stock.is_alert_triggered);
        assert!(!stock.id.is_empty());
    }

    #[test]
    fn test_migrate_drops_unusable_and_duplicate_stocks() {
        let raw = json!({
            "version": 1,
            "watchedStocks": [
                { "symbol": "AAPL", "alertPrice": 150.0 },
                { "symbol": "aapl", "alertPrice": 99.0 },
                { "symbol": "MSFT" },
                { "symbol": "TSLA", "alertPrice": 0.0 },
                { "symbol": "NFLX", "alertPrice": -5.0 },
                { "alertPrice": 10.0 },
                "garbage"
            ],
            "refreshTimeInterval": 60000,
            "isLiveDataEnabled": false
        })
        .to_string();

        let state = migrate(&raw).unwrap();
        assert_eq!(state.watched_stocks.len(), 1);
        assert_eq!(state.watched_stocks[0].alert_price, 150.0);
        assert_eq!(state.refresh_interval(), Duration::from_secs(60));
        assert!(!state.is_live_data_enabled);
    }

    #[test]
    fn test_migrate_rejects_invalid_json() {
        assert!(migrate("{not json").is_err());
    }

    #[test]
    fn test_current_snapshot_survives_migration() {
        let mut stock = WatchedStock::new("AAPL", "Apple Inc.", 150.0);
        stock.apply_quote(
            &crate::models::Quote::from_price("AAPL", 151.0, chrono::Utc::now()),
            chrono::Utc::now(),
        );
        stock.is_alert_triggered = true;
        let saved = PersistedState::capture(&[stock.clone()], Duration::from_secs(45), true);

        let store = MemoryStore::new();
        save(&store, &saved).unwrap();
        let loaded = load(&store).unwrap().unwrap();

        assert_eq!(loaded.watched_stocks[0].id, stock.id);
        assert_eq!(loaded.watched_stocks[0].current_price, Some(151.0));
        assert!(loaded.watched_stocks[0].is_alert_triggered);
        assert!(!loaded.watched_stocks[0].is_loading);
        assert_eq!(loaded.watched_stocks[0].price_history.len(), 1);
        assert_eq!(loaded.refresh_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.get(STATE_KEY).unwrap(), None);
        store.set(STATE_KEY, "{\"version\":2}").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(STATE_KEY).unwrap().as_deref(),
            Some("{\"version\":2}")
        );
    }
}
