use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::StateStore;
use crate::clock::SharedClock;
use crate::error::StoreError;

/// SQLite-backed store that survives broker restarts and can be shared by
/// several broker processes on one host.
///
/// Every primitive is a single immediate transaction run on the blocking
/// pool, so the async runtime never waits on SQLite I/O.
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
    clock: SharedClock,
}

impl SqliteStore {
    pub fn open(path: &Path, clock: SharedClock) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", dir.display())))?;
        }
        let conn = Connection::open(path)?;
        // WAL so readers in other broker processes do not block writers
        match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        }) {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
            Ok(mode) => tracing::warn!(
                path = %path.display(),
                %mode,
                "sqlite store is not in WAL mode, other broker processes may block on it"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to switch sqlite store to WAL mode"
            ),
        }
        if let Err(e) = conn.pragma_update(None, "synchronous", "NORMAL") {
            tracing::warn!(path = %path.display(), error = %e, "failed to set sqlite synchronous mode");
        }
        Self::init(conn, clock)
    }

    pub fn open_in_memory(clock: SharedClock) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: SharedClock) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY NOT NULL,
                value       TEXT NOT NULL,
                expires_at  INTEGER
            );
            CREATE TABLE IF NOT EXISTS set_members (
                set_key     TEXT NOT NULL,
                member      TEXT NOT NULL,
                PRIMARY KEY (set_key, member)
            );",
        )?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        if count > 0 {
            tracing::info!(count, "loaded broker state from disk");
        }

        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            clock,
        })
    }

    async fn with_conn<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, i64) -> Result<R, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let now = self.clock.now_ms() as i64;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
            f(&mut conn, now).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
    }
}

fn expires_at(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now + ttl.as_millis() as i64)
}

fn live_value(conn: &Connection, key: &str, now: i64) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |row| row.get(0),
    )
    .optional()
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn, now| live_value(conn, &key, now))
            .await
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn, now| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at(now, ttl)],
            )
            .map(|_| ())
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.map(str::to_string);
        let new = new.map(str::to_string);
        self.with_conn(move |conn, now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = live_value(&tx, &key, now)?;
            if current != expected {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                        params![key, value, expires_at(now, ttl)],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn, now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existed = live_value(&tx, &key, now)?.is_some();
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            tx.commit()?;
            Ok(existed)
        })
        .await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let prefix = prefix.to_string();
        let after = after.map(str::to_string);
        self.with_conn(move |conn, now| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            let mut stmt = conn.prepare_cached(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (?2 IS NULL OR key > ?2)
                 ORDER BY key
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![prefix, after, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect()
        })
        .await
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let (set, member) = (set.to_string(), member.to_string());
        self.with_conn(move |conn, _| {
            conn.execute(
                "INSERT OR IGNORE INTO set_members (set_key, member) VALUES (?1, ?2)",
                params![set, member],
            )
            .map(|n| n == 1)
        })
        .await
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let (set, member) = (set.to_string(), member.to_string());
        self.with_conn(move |conn, _| {
            conn.execute(
                "DELETE FROM set_members WHERE set_key = ?1 AND member = ?2",
                params![set, member],
            )
            .map(|n| n == 1)
        })
        .await
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StoreError> {
        let set = set.to_string();
        self.with_conn(move |conn, _| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let member: Option<String> = tx
                .query_row(
                    "SELECT member FROM set_members WHERE set_key = ?1 ORDER BY member LIMIT 1",
                    params![set],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(member) = &member {
                tx.execute(
                    "DELETE FROM set_members WHERE set_key = ?1 AND member = ?2",
                    params![set, member],
                )?;
            }
            tx.commit()?;
            Ok(member)
        })
        .await
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let set = set.to_string();
        self.with_conn(move |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT member FROM set_members WHERE set_key = ?1 ORDER BY member",
            )?;
            let rows = stmt.query_map(params![set], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        let set = set.to_string();
        self.with_conn(move |conn, _| {
            conn.query_row(
                "SELECT COUNT(*) FROM set_members WHERE set_key = ?1",
                params![set],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, _| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }
}
