//! Advisory try-lock over the key-value store.
//!
//! `acquire` is a read-then-write with no compare-and-swap, so two workers
//! racing inside the same instant can both succeed. TTL expiry is what frees
//! the lock of a crashed holder.

use std::sync::Arc;

use sitesync_core::{Clock, KvError, KvStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    /// Our token when acquired, otherwise the current holder's.
    pub holder: Option<String>,
}

#[derive(Clone)]
pub struct DistributedLock {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

pub fn lock_key(name: &str) -> String {
    format!("sync:lock:{name}")
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Try once to take `name` for `ttl_secs`. Never waits.
    pub async fn acquire(&self, name: &str, ttl_secs: u64) -> Result<LockAcquisition, KvError> {
        let key = lock_key(name);
        if let Some(existing) = self.kv.get(&key).await? {
            debug!(lock = %key, holder = %existing, "lock held");
            return Ok(LockAcquisition {
                acquired: false,
                holder: Some(existing),
            });
        }

        let holder = format!("{name}-{}", self.clock.now_ms());
        self.kv.put(&key, &holder, Some(ttl_secs)).await?;
        debug!(lock = %key, holder = %holder, ttl_secs, "lock acquired");
        Ok(LockAcquisition {
            acquired: true,
            holder: Some(holder),
        })
    }

    /// Delete the lock key without checking who holds it.
    ///
    /// A caller whose lock already expired and was re-taken elsewhere will
    /// delete the new holder's lock. Failures are logged and dropped; TTL
    /// expiry cleans up an orphaned key.
    pub async fn release(&self, name: &str) {
        let key = lock_key(name);
        match self.kv.delete(&key).await {
            Ok(()) => debug!(lock = %key, "lock released"),
            Err(e) => warn!(lock = %key, error = %e, "lock release failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sitesync_core::{ManualClock, MemoryKvStore};

    fn lock() -> (DistributedLock, Arc<ManualClock>, Arc<MemoryKvStore>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let kv = Arc::new(MemoryKvStore::new(clock.clone()));
        (DistributedLock::new(kv.clone(), clock.clone()), clock, kv)
    }

    #[tokio::test]
    async fn second_acquire_sees_first_holder() {
        let (lock, _, kv) = lock();
        let first = lock.acquire("source-full", 300).await.unwrap();
        assert!(first.acquired);
        assert_eq!(first.holder.as_deref(), Some("source-full-1000"));
        assert_eq!(
            kv.get("sync:lock:source-full").await.unwrap().as_deref(),
            Some("source-full-1000")
        );

        let second = lock.acquire("source-full", 300).await.unwrap();
        assert!(!second.acquired);
        assert_eq!(second.holder, first.holder);
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let (lock, _, _) = lock();
        assert!(lock.acquire("a", 300).await.unwrap().acquired);
        lock.release("a").await;
        assert!(lock.acquire("a", 300).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn ttl_expiry_frees_lock() {
        let (lock, clock, _) = lock();
        assert!(lock.acquire("a", 300).await.unwrap().acquired);
        clock.advance_secs(300);
        let again = lock.acquire("a", 300).await.unwrap();
        assert!(again.acquired);
        assert_eq!(again.holder.as_deref(), Some("a-301000"));
    }

    #[tokio::test]
    async fn release_is_unconditional() {
        let (lock, clock, _) = lock();
        assert!(lock.acquire("a", 10).await.unwrap().acquired);
        // Original holder's TTL lapses and another worker takes the lock.
        clock.advance_secs(10);
        assert!(lock.acquire("a", 10).await.unwrap().acquired);
        // The stale holder's release still removes the new lock.
        lock.release("a").await;
        assert!(lock.acquire("a", 10).await.unwrap().acquired);
    }

    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Backend("down".to_string()))
        }
        async fn put(&self, _key: &str, _value: &str, _ttl: Option<u64>) -> Result<(), KvError> {
            Err(KvError::Backend("down".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            Err(KvError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn release_swallows_backend_errors() {
        let lock = DistributedLock::new(Arc::new(BrokenKv), Arc::new(ManualClock::new(0)));
        lock.release("a").await;
        assert!(lock.acquire("a", 10).await.is_err());
    }
}
