use std::sync::Arc;
use std::time::Duration;

use sitesync_core::Clock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{SourceConnection, SourceConnector, SourceError};

struct Pooled {
    conn: Arc<dyn SourceConnection>,
    last_used_ms: i64,
}

/// Single cached connection per process.
///
/// A cached connection younger than the TTL is pinged (bounded by
/// `ping_timeout`) before reuse; a failed ping discards it and a fresh one is
/// opened.
pub struct ConnectionPool {
    connector: Arc<dyn SourceConnector>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    ping_timeout: Duration,
    cached: Mutex<Option<Pooled>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            clock,
            ttl_ms: ttl.as_millis() as i64,
            ping_timeout,
            cached: Mutex::new(None),
        }
    }

    async fn ping_bounded(&self, conn: &dyn SourceConnection) -> Result<(), SourceError> {
        match tokio::time::timeout(self.ping_timeout, conn.ping()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                operation: "ping".to_string(),
                timeout_ms: self.ping_timeout.as_millis() as u64,
            }),
        }
    }

    /// Reuse the cached connection if still fresh and alive, otherwise connect.
    pub async fn get(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        self.checkout().await.map(|(conn, _)| conn)
    }

    /// Like [`get`](Self::get), also reporting whether the connection was
    /// just pinged (a reused one) or is freshly opened and unverified.
    async fn checkout(&self) -> Result<(Arc<dyn SourceConnection>, bool), SourceError> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now_ms();

        if let Some(pooled) = cached.as_mut() {
            if now - pooled.last_used_ms < self.ttl_ms {
                match self.ping_bounded(pooled.conn.as_ref()).await {
                    Ok(()) => {
                        pooled.last_used_ms = now;
                        return Ok((pooled.conn.clone(), true));
                    }
                    Err(e) => {
                        debug!(error = %e, "cached source connection ping failed, rotating");
                    }
                }
            }
        }
        if let Some(stale) = cached.take() {
            stale.conn.close().await;
        }

        let conn = self.connector.connect().await?;
        *cached = Some(Pooled {
            conn: conn.clone(),
            last_used_ms: now,
        });
        debug!("opened new source connection");
        Ok((conn, false))
    }

    /// Bounded connectivity check. Never errors; failures are logged.
    pub async fn test_connection(&self) -> bool {
        let result = match self.checkout().await {
            Ok((_, true)) => Ok(()),
            Ok((conn, false)) => self.ping_bounded(conn.as_ref()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(code = e.code(), error = %e, "source connection test failed");
                false
            }
        }
    }

    /// Close and evict the cached connection if it has sat idle past the TTL.
    /// Returns the number of connections evicted.
    pub async fn cleanup_expired(&self) -> usize {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now_ms();
        let expired = cached
            .as_ref()
            .is_some_and(|p| now - p.last_used_ms > self.ttl_ms);
        if !expired {
            return 0;
        }
        if let Some(stale) = cached.take() {
            stale.conn.close().await;
            debug!("evicted idle source connection");
        }
        1
    }

    #[cfg(test)]
    pub async fn is_cached(&self) -> bool {
        self.cached.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::EmployeePage;
    use async_trait::async_trait;
    use sitesync_core::types::ExternalEmployee;
    use sitesync_core::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeConn {
        pings: AtomicU32,
        alive: AtomicBool,
        hang: bool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SourceConnection for FakeConn {
        async fn ping(&self) -> Result<(), SourceError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SourceError::Unreachable("gone".to_string()))
            }
        }
        async fn fetch_employees(
            &self,
            _since: Option<&str>,
        ) -> Result<Vec<ExternalEmployee>, SourceError> {
            Ok(Vec::new())
        }
        async fn fetch_page(&self, _offset: u64, _limit: u64) -> Result<EmployeePage, SourceError> {
            Ok(EmployeePage::default())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        connects: AtomicU32,
        hang: bool,
        last: std::sync::Mutex<Option<Arc<FakeConn>>>,
    }

    impl FakeConnector {
        fn new(hang: bool) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU32::new(0),
                hang,
                last: std::sync::Mutex::new(None),
            })
        }

        fn last(&self) -> Arc<FakeConn> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl SourceConnector for FakeConnector {
        async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let conn = Arc::new(FakeConn {
                pings: AtomicU32::new(0),
                alive: AtomicBool::new(true),
                hang: self.hang,
                closed: AtomicBool::new(false),
            });
            *self.last.lock().unwrap() = Some(conn.clone());
            Ok(conn)
        }
    }

    fn pool(connector: Arc<FakeConnector>, clock: Arc<ManualClock>) -> ConnectionPool {
        ConnectionPool::new(
            connector,
            clock,
            Duration::from_secs(30),
            Duration::from_millis(5000),
        )
    }

    #[tokio::test]
    async fn reuses_fresh_connection() {
        let connector = FakeConnector::new(false);
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool(connector.clone(), clock.clone());

        pool.get().await.unwrap();
        clock.advance_secs(10);
        pool.get().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotates_after_ttl_or_failed_ping() {
        let connector = FakeConnector::new(false);
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool(connector.clone(), clock.clone());

        pool.get().await.unwrap();
        clock.advance_secs(30);
        pool.get().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        let current = connector.last();
        current.alive.store(false, Ordering::SeqCst);
        pool.get().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert!(current.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_ping_is_bounded() {
        let connector = FakeConnector::new(true);
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool(connector.clone(), clock);
        assert!(!pool.test_connection().await);
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_connection_only() {
        let connector = FakeConnector::new(false);
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool(connector.clone(), clock.clone());

        assert_eq!(pool.cleanup_expired().await, 0);
        pool.get().await.unwrap();
        clock.advance_secs(30);
        assert_eq!(pool.cleanup_expired().await, 0);
        clock.advance_secs(1);
        assert_eq!(pool.cleanup_expired().await, 1);
        assert!(!pool.is_cached().await);
        assert!(connector.last().closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connection_true_when_alive() {
        let connector = FakeConnector::new(false);
        let pool = pool(connector, Arc::new(ManualClock::new(0)));
        assert!(pool.test_connection().await);
        assert!(pool.is_cached().await);
    }

    #[tokio::test]
    async fn test_connection_pings_once_per_call() {
        let connector = FakeConnector::new(false);
        let pool = pool(connector.clone(), Arc::new(ManualClock::new(0)));

        // Fresh connection: verified by one explicit ping.
        assert!(pool.test_connection().await);
        assert_eq!(connector.last().pings.load(Ordering::SeqCst), 1);

        // Reused connection: the reuse ping is the only one.
        assert!(pool.test_connection().await);
        assert_eq!(connector.last().pings.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
