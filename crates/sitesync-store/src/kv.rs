use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use sitesync_core::kv::{KvError, KvStore};
use sitesync_core::Clock;

use crate::db::init_db;
use crate::error::StoreError;

/// Durable key-value store on the `kv_entries` table.
///
/// Expired rows are invisible to `get` and deleted the first time they are
/// read after expiry.
pub struct SqliteKvStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteKvStore {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
        })
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
        self.db
            .lock()
            .map_err(|_| KvError::Backend(StoreError::Poisoned.to_string()))
    }

    /// Delete every expired row. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, KvError> {
        let db = self.db()?;
        db.execute(
            "DELETE FROM kv_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![self.clock.now_ms()],
        )
        .map_err(backend)
    }
}

fn backend(e: rusqlite::Error) -> KvError {
    KvError::Backend(e.to_string())
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let db = self.db()?;
        let row: Option<(String, Option<i64>)> = db
            .query_row(
                "SELECT value, expires_at_ms FROM kv_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        match row {
            None => Ok(None),
            Some((_, Some(exp))) if exp <= self.clock.now_ms() => {
                db.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
                    .map_err(backend)?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        let expires_at_ms = ttl_secs.map(|ttl| self.clock.now_ms() + (ttl as i64) * 1000);
        let db = self.db()?;
        db.execute(
            "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
            params![key, value, expires_at_ms],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let db = self.db()?;
        db.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::ManualClock;

    fn kv(clock: Arc<ManualClock>) -> SqliteKvStore {
        SqliteKvStore::new(Connection::open_in_memory().unwrap(), clock).unwrap()
    }

    #[tokio::test]
    async fn roundtrip_and_delete() {
        let store = kv(Arc::new(ManualClock::new(0)));
        store.put("job:a:enabled", "false", None).await.unwrap();
        assert_eq!(
            store.get("job:a:enabled").await.unwrap().as_deref(),
            Some("false")
        );
        store.put("job:a:enabled", "true", None).await.unwrap();
        assert_eq!(
            store.get("job:a:enabled").await.unwrap().as_deref(),
            Some("true")
        );
        store.delete("job:a:enabled").await.unwrap();
        assert_eq!(store.get("job:a:enabled").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = kv(clock.clone());
        store.put("source:status", "down", Some(600)).await.unwrap();
        store.put("sticky", "1", None).await.unwrap();

        clock.advance_secs(599);
        assert_eq!(
            store.get("source:status").await.unwrap().as_deref(),
            Some("down")
        );
        clock.advance_secs(1);
        assert_eq!(store.get("source:status").await.unwrap(), None);
        assert_eq!(store.purge_expired().unwrap(), 0);
        assert_eq!(store.get("sticky").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn purge_removes_expired_rows() {
        let clock = Arc::new(ManualClock::new(0));
        let store = kv(clock.clone());
        store.put("a", "1", Some(1)).await.unwrap();
        store.put("b", "2", Some(1)).await.unwrap();
        store.put("c", "3", Some(100)).await.unwrap();
        clock.advance_secs(5);
        assert_eq!(store.purge_expired().unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("3"));
    }
}
