use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::StateStore;
use crate::clock::SharedClock;
use crate::error::StoreError;

struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// Single-process store. Every primitive runs under one mutex, which makes
/// each of them atomic; expiry is checked lazily against the injected clock.
pub struct MemoryStore {
    inner: StdMutex<Inner>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: StdMutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.clock.now_ms() + ttl.as_millis() as u64)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let inner = self.lock()?;
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at_ms = self.expiry(ttl);
        self.lock()?.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut inner = self.lock()?;
        let current = inner
            .kv
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                inner.kv.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at_ms,
                    },
                );
            }
            None => {
                inner.kv.remove(key);
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .lock()?
            .kv
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        inner.kv.retain(|_, e| e.is_live(now));

        let start = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        Ok(inner
            .kv
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .sets
            .get_mut(set)
            .is_some_and(|s| s.remove(member)))
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.sets.get_mut(set).and_then(|s| s.pop_first()))
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.sets.get(set).map_or(0, |s| s.len()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
