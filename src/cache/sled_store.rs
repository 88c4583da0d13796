//! sled-backed cache with per-key TTL
//!
//! Each value is stored as a JSON `CacheEntry` carrying an optional expiry
//! in epoch milliseconds. Expired entries are treated as absent and removed
//! when read.
//!
//! Every public operation swallows its errors after logging them and returns
//! the cold-cache answer (`None`, `false`, `0` or an empty list).

use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::Db;
use tracing::{debug, error, info, warn};

use crate::utils::error::CacheError;
use crate::utils::retry::{RetryPolicy, with_retry};

pub const PRODUCTS_TTL_SECS: u64 = 1800;
pub const SESSION_TTL_SECS: u64 = 86_400;
pub const CART_TTL_SECS: u64 = 604_800;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    fn new(value: Value, ttl_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(expiry_from_now),
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

fn expiry_from_now(ttl_secs: u64) -> i64 {
    let ttl_ms = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000) * 1000;
    Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

pub struct CacheService {
    path: String,
    db: RwLock<Option<Db>>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl CacheService {
    /// A disconnected cache that will open the database at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    pub fn connect(&self) -> Result<(), CacheError> {
        let db = sled::open(&self.path)?;
        *self.db.write().unwrap_or_else(PoisonError::into_inner) = Some(db);
        info!("Cache connected at {}", self.path);
        Ok(())
    }

    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> bool {
        with_retry("Cache", policy, || async move { self.connect() })
            .await
            .is_some()
    }

    pub fn disconnect(&self) {
        let db = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(db) = db {
            if let Err(e) = db.flush() {
                warn!("Cache flush on disconnect failed: {e}");
            }
            info!("Cache connection ended");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn db(&self) -> Result<Db, CacheError> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CacheError::NotConnected)
    }

    fn read_entry(&self, db: &Db, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(raw) = db.get(key)? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        if entry.is_expired(Utc::now().timestamp_millis()) {
            // only delete the bytes we saw; a concurrent set wins
            if db
                .compare_and_swap(key, Some(&raw), None::<&[u8]>)?
                .is_err()
            {
                debug!("Expired entry '{key}' was replaced before removal");
            }
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn write_entry(db: &Db, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        db.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let result = self.db().and_then(|db| self.read_entry(&db, key));
        swallow("get", key, result).flatten().map(|entry| entry.value)
    }

    /// Store `value` for `ttl_secs` seconds.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        let result = self.db().and_then(|db| {
            let entry = CacheEntry::new(serde_json::to_value(value)?, Some(ttl_secs));
            Self::write_entry(&db, key, &entry)
        });
        swallow("set", key, result).is_some()
    }

    /// True when the delete ran, whether or not the key existed.
    pub fn del(&self, key: &str) -> bool {
        let result = self
            .db()
            .and_then(|db| db.remove(key).map(|_| ()).map_err(CacheError::from));
        swallow("delete", key, result).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        let result = self.db().and_then(|db| self.read_entry(&db, key));
        swallow("exists", key, result).flatten().is_some()
    }

    /// Reset the TTL of an existing key. False when the key is absent.
    pub fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let result = self.db().and_then(|db| {
            update_entry(&db, key, |current| {
                Ok(match current {
                    Some(mut entry) => {
                        entry.expires_at = Some(expiry_from_now(ttl_secs));
                        (Some(entry), true)
                    }
                    None => (None, false),
                })
            })
        });
        swallow("expire", key, result).unwrap_or(false)
    }

    /// One slot per key, `None` for misses. Empty when disconnected.
    pub fn mget(&self, keys: &[&str]) -> Vec<Option<Value>> {
        let Ok(db) = self.db() else {
            return Vec::new();
        };
        keys.iter()
            .map(|key| {
                swallow("mget", key, self.read_entry(&db, key))
                    .flatten()
                    .map(|entry| entry.value)
            })
            .collect()
    }

    /// Atomically increment an integer counter, creating it at 1. Returns 0
    /// on failure. An existing TTL is kept.
    pub fn incr(&self, key: &str) -> i64 {
        let result = self.db().and_then(|db| {
            update_entry(&db, key, |current| {
                let (count, expires_at) = match current {
                    None => (1, None),
                    Some(CacheEntry { value, expires_at }) => match value.as_i64() {
                        Some(n) => (n.saturating_add(1), expires_at),
                        None => return Err(CacheError::Serialization(not_an_integer(key))),
                    },
                };
                let entry = CacheEntry {
                    value: Value::from(count),
                    expires_at,
                };
                Ok((Some(entry), count))
            })
        });
        swallow("incr", key, result).unwrap_or(0)
    }

    pub fn flush_all(&self) -> bool {
        let result = self.db().and_then(|db| db.clear().map_err(CacheError::from));
        swallow("flush", "*", result).is_some()
    }

    pub fn cache_products<T: Serialize + ?Sized>(&self, products: &T, category: &str) -> bool {
        self.set(&format!("products:{category}"), products, PRODUCTS_TTL_SECS)
    }

    pub fn get_cached_products(&self, category: &str) -> Option<Value> {
        self.get(&format!("products:{category}"))
    }

    pub fn cache_user_session<T: Serialize + ?Sized>(&self, user_id: &str, session: &T) -> bool {
        self.set(&format!("session:{user_id}"), session, SESSION_TTL_SECS)
    }

    pub fn get_cached_user_session(&self, user_id: &str) -> Option<Value> {
        self.get(&format!("session:{user_id}"))
    }

    pub fn cache_cart<T: Serialize + ?Sized>(&self, user_id: &str, cart: &T) -> bool {
        self.set(&format!("cart:{user_id}"), cart, CART_TTL_SECS)
    }

    pub fn get_cached_cart(&self, user_id: &str) -> Option<Value> {
        self.get(&format!("cart:{user_id}"))
    }
}

/// Atomic read-modify-write of one entry on top of `update_and_fetch`.
///
/// `f` sees `None` for absent or expired keys and returns the entry to store
/// (`None` deletes) plus its result. It may run more than once under
/// contention; only the last run is committed. When `f` fails the stored
/// bytes are left untouched.
fn update_entry<T: Default>(
    db: &Db,
    key: &str,
    mut f: impl FnMut(Option<CacheEntry>) -> Result<(Option<CacheEntry>, T), CacheError>,
) -> Result<T, CacheError> {
    let now = Utc::now().timestamp_millis();
    let mut outcome = Ok(T::default());

    db.update_and_fetch(key, |old| {
        let step = old
            .map(|raw| serde_json::from_slice::<CacheEntry>(raw))
            .transpose()
            .map_err(CacheError::from)
            .and_then(|entry| f(entry.filter(|e| !e.is_expired(now))))
            .and_then(|(next, value)| {
                let bytes = next.map(|e| serde_json::to_vec(&e)).transpose()?;
                Ok((bytes, value))
            });
        match step {
            Ok((bytes, value)) => {
                outcome = Ok(value);
                bytes
            }
            Err(e) => {
                outcome = Err(e);
                old.map(<[u8]>::to_vec)
            }
        }
    })?;

    outcome
}

fn not_an_integer(key: &str) -> serde_json::Error {
    serde::de::Error::custom(format!("value at '{key}' is not an integer"))
}

/// Log and drop a cache error. Disconnected is the expected cold-cache case
/// and stays quiet.
fn swallow<T>(op: &str, key: &str, result: Result<T, CacheError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(CacheError::NotConnected) => None,
        Err(e) => {
            error!("Cache {op} error for '{key}': {e}");
            None
        }
    }
}
