use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::keys;
use crate::store::SharedStore;

/// What a lock protects. Locks are scoped to one id, never global. Slot
/// records are written by compare-and-swap instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Workload,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockScope::Workload => "workload",
        })
    }
}

/// Short-lived mutual exclusion on top of the store's expiring keys.
///
/// A lock is a key holding a random token with a TTL. A holder that dies
/// simply lets it expire. Release only deletes the key if it still holds
/// the caller's token.
#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    ttl: Duration,
    wait: Duration,
}

#[must_use = "a lock must be released"]
pub struct LockGuard {
    store: SharedStore,
    key: String,
    token: String,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

impl LockManager {
    pub fn new(store: SharedStore, ttl: Duration, wait: Duration) -> Self {
        Self { store, ttl, wait }
    }

    /// Takes the lock on `scope`/`id`, retrying until `wait` has passed.
    /// A lock still busy after that is reported as a `Conflict`.
    pub async fn acquire(&self, scope: LockScope, id: &str) -> Result<LockGuard, BrokerError> {
        let key = keys::lock(&scope.to_string(), id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self
                .store
                .put_if_absent(&key, &token, Some(self.ttl))
                .await?
            {
                return Ok(LockGuard {
                    store: self.store.clone(),
                    key,
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::Conflict(format!(
                    "{scope} {id} is busy, retry shortly"
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl LockGuard {
    pub async fn release(self) {
        match self
            .store
            .compare_and_swap(&self.key, Some(&self.token), None, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(key = %self.key, "lock expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to release lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StateStore};

    fn manager(wait_ms: u64) -> (LockManager, SharedStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        let locks = LockManager::new(
            store.clone(),
            Duration::from_secs(5),
            Duration::from_millis(wait_ms),
        );
        (locks, store, clock)
    }

    #[tokio::test]
    async fn second_holder_waits_then_conflicts() {
        let (locks, _, _) = manager(20);
        let guard = locks
            .acquire(LockScope::Workload, "w1")
            .await
            .expect("first acquire");

        let err = locks
            .acquire(LockScope::Workload, "w1")
            .await
            .err()
            .expect("busy lock");
        assert!(matches!(err, BrokerError::Conflict(_)));

        let other = locks
            .acquire(LockScope::Workload, "w2")
            .await
            .expect("different id is independent");
        other.release().await;

        guard.release().await;
        locks
            .acquire(LockScope::Workload, "w1")
            .await
            .expect("free after release")
            .release()
            .await;
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let (locks, store, clock) = manager(20);
        let stale = locks
            .acquire(LockScope::Workload, "w2")
            .await
            .expect("acquire");
        clock.advance(Duration::from_secs(6));

        let fresh = locks
            .acquire(LockScope::Workload, "w2")
            .await
            .expect("takeover after ttl");

        // The stale holder must not delete the new holder's lock.
        stale.release().await;
        assert!(store.get("lock:workload:w2").await.expect("get").is_some());
        fresh.release().await;
        assert!(store.get("lock:workload:w2").await.expect("get").is_none());
    }
}
