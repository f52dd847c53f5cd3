//! Shared key/value state with the atomic primitives the broker relies on:
//! conditional writes, expiring keys and set-membership pop.
//!
//! The store owns no domain logic. Every durable fact the broker knows lives
//! here, so any number of broker processes can share one store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::SharedClock;
use crate::config::{StoreConfig, StoreKind};
use crate::error::StoreError;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value of `key`, treating expired keys as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl` of `None` means the key never expires.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically replaces the value of `key` if it currently equals
    /// `expected` (`None` = absent or expired). A `new` of `None` deletes.
    /// Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Removes `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live `(key, value)` pairs whose key starts with `prefix` and sorts
    /// strictly after `after`, in key order, at most `limit` of them.
    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError>;

    /// Adds `member` to `set`. Returns false if it was already present.
    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Atomically removes and returns one member of `set`.
    async fn set_pop(&self, set: &str) -> Result<Option<String>, StoreError>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.compare_and_swap(key, None, Some(value), ttl).await
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        Ok(self.set_members(set).await?.len())
    }
}

pub type SharedStore = Arc<dyn StateStore>;

/// Opens the backend selected by `config`.
pub fn open(config: &StoreConfig, clock: SharedClock) -> Result<SharedStore, StoreError> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new(clock))),
        StoreKind::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(spectate_protocol::paths::default_sqlite_path);
            Ok(Arc::new(SqliteStore::open(&path, clock)?))
        }
    }
}

/// A decoded record plus the exact serialized value it was read from.
///
/// Writes are conditioned on `raw`, so a record that changed between read
/// and write makes the write fail instead of clobbering it.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    raw: String,
}

impl<T> Versioned<T> {
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub fn decode<T: DeserializeOwned>(key: &str, raw: String) -> Result<Versioned<T>, StoreError> {
    let value = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Versioned { value, raw })
}

pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<Versioned<T>>, StoreError> {
    match store.get(key).await? {
        Some(raw) => decode(key, raw).map(Some),
        None => Ok(None),
    }
}

/// Writes `next` only if `key` still holds exactly what `current` was read from.
pub async fn swap<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    current: &Versioned<T>,
    next: &T,
    ttl: Option<Duration>,
) -> Result<bool, StoreError> {
    let raw = encode(key, next)?;
    store
        .compare_and_swap(key, Some(current.raw()), Some(&raw), ttl)
        .await
}

/// Deletes `key` only if it still holds exactly what `current` was read from.
pub async fn remove<T>(
    store: &dyn StateStore,
    key: &str,
    current: &Versioned<T>,
) -> Result<bool, StoreError> {
    store
        .compare_and_swap(key, Some(current.raw()), None, None)
        .await
}

/// Creates `key` with `value` unless something live is already there.
pub async fn insert_new<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<bool, StoreError> {
    let raw = encode(key, value)?;
    store.put_if_absent(key, &raw, ttl).await
}
