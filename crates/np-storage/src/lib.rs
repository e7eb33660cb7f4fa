//! Persistence for pairing sessions.
//!
//! [`KeyValueStore`] is the raw string-to-string backend (RocksDB on disk, a
//! `HashMap` in tests). [`JsonStore`] layers tolerant JSON access on top of
//! it and [`SessionStore`] gives the typed view used by the wallet core.

mod session;

pub use session::{
    MAX_RECENT_CONNECTIONS, PUBKEYS_KEY, RECENT_CONNECTIONS_KEY, RecentConnection, SESSION_KEY,
    SESSION_TTL_MS, SessionStore, SessionUpdate, WalletSession,
};

use anyhow::Result;
use rocksdb::{DB, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn load(&self, key: &str) -> Result<Option<String>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        (**self).save(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// JSON access that never fails: unreadable or malformed entries fall back
/// to the caller's default and failed writes are logged.
pub trait JsonStore: KeyValueStore {
    fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let raw = match self.load(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return default,
            Err(err) => {
                warn!("failed to read '{}' from store: {}", key, err);
                return default;
            }
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!("malformed value stored under '{}', using default: {}", key, err);
                default
            }
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to serialize value for '{}': {}", key, err);
                return;
            }
        };

        if let Err(err) = self.save(key, &raw) {
            warn!("failed to write '{}' to store: {}", key, err);
        }
    }

    fn clear(&self, key: &str) {
        if let Err(err) = self.remove(key) {
            warn!("failed to clear '{}' from store: {}", key, err);
        }
    }
}

impl<T: KeyValueStore + ?Sized> JsonStore for T {}

#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let guard = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;
        guard.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;
        guard.remove(key);
        Ok(())
    }
}

pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key_for(key: &str) -> String {
        format!("kv:{key}")
    }
}

impl KeyValueStore for RocksDbStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let value = self.db.get(Self::key_for(key).as_bytes())?;
        match value {
            Some(raw) => Ok(Some(String::from_utf8(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.db.put(Self::key_for(key).as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.delete(Self::key_for(key).as_bytes())?;
        Ok(())
    }
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u128;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u128 {
        u128::from(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn missing_key_returns_default() {
        let store = InMemoryStore::new();
        let value: Vec<String> = store.get_or("absent", vec!["fallback".to_owned()]);
        assert_eq!(value, vec!["fallback".to_owned()]);
    }

    #[test]
    fn malformed_json_returns_default() -> Result<()> {
        let store = InMemoryStore::new();
        store.save("sample", "{not json")?;

        let value: Option<Sample> = store.get_or("sample", None);
        assert!(value.is_none());
        Ok(())
    }

    #[test]
    fn wrong_shape_returns_default() -> Result<()> {
        let store = InMemoryStore::new();
        store.save("sample", r#"{"name": 7}"#)?;

        let value = store.get_or(
            "sample",
            Sample {
                name: "default".to_owned(),
                count: 0,
            },
        );
        assert_eq!(value.name, "default");
        Ok(())
    }

    #[test]
    fn set_then_clear() {
        let store = InMemoryStore::new();
        let sample = Sample {
            name: "swap".to_owned(),
            count: 3,
        };

        store.set("sample", &sample);
        let loaded: Option<Sample> = store.get_or("sample", None);
        assert_eq!(loaded, Some(sample));

        store.clear("sample");
        let loaded: Option<Sample> = store.get_or("sample", None);
        assert!(loaded.is_none());
    }

    #[test]
    fn rocksdb_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kv");
        let path = path.to_string_lossy().to_string();

        {
            let store = RocksDbStore::open_default(&path)?;
            store.set("greeting", &"hello".to_owned());
        }

        let store = RocksDbStore::open_default(&path)?;
        let greeting: String = store.get_or("greeting", String::new());
        assert_eq!(greeting, "hello");

        store.clear("greeting");
        let greeting: String = store.get_or("greeting", "gone".to_owned());
        assert_eq!(greeting, "gone");
        Ok(())
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }
}
