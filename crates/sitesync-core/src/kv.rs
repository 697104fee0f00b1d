//! Key-value backing store contract shared by the lock, alert cooldowns,
//! status flags and persisted job run state.
//!
//! There is deliberately no compare-and-swap: anything built on top of this
//! trait (notably the sync lock) is advisory.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Current value, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write `value`. With `ttl_secs`, the backend expires the entry on its own.
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<i64>,
}

/// Process-local store with TTL enforcement against an injected clock.
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .iter()
            .filter(|e| e.expires_at_ms.map_or(true, |exp| exp > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) => match entry.expires_at_ms {
                Some(exp) if exp <= now => {}
                _ => return Ok(Some(entry.value.clone())),
            },
        }
        // a put may have replaced the entry since the read
        self.entries
            .remove_if(key, |_, e| e.expires_at_ms.is_some_and(|exp| exp <= now));
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        let expires_at_ms = ttl_secs.map(|ttl| self.clock.now_ms() + (ttl as i64) * 1000);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }
}
