use std::sync::Arc;

use sitesync_core::KvStore;
use tracing::warn;

use crate::error::Result;

/// Persisted per-job run state: `job:<name>:enabled` and `job:<name>:lastRun`.
///
/// Absent entries mean "enabled, never run".
#[derive(Clone)]
pub struct JobStateStore {
    kv: Arc<dyn KvStore>,
}

fn enabled_key(name: &str) -> String {
    format!("job:{name}:enabled")
}

fn last_run_key(name: &str) -> String {
    format!("job:{name}:lastRun")
}

impl JobStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(match self.kv.get(&enabled_key(name)).await? {
            Some(v) => v != "false",
            None => true,
        })
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.kv
            .put(&enabled_key(name), if enabled { "true" } else { "false" }, None)
            .await?;
        Ok(())
    }

    pub async fn last_run(&self, name: &str) -> Result<Option<i64>> {
        let raw = self.kv.get(&last_run_key(name)).await?;
        Ok(raw.and_then(|v| match v.parse::<i64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                warn!(job = %name, value = %v, "ignoring unparseable lastRun");
                None
            }
        }))
    }

    pub async fn set_last_run(&self, name: &str, epoch_ms: i64) -> Result<()> {
        self.kv
            .put(&last_run_key(name), &epoch_ms.to_string(), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::{ManualClock, MemoryKvStore};

    fn store() -> (JobStateStore, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new(Arc::new(ManualClock::new(0))));
        (JobStateStore::new(kv.clone()), kv)
    }

    #[tokio::test]
    async fn defaults_enabled_and_never_run() {
        let (state, _) = store();
        assert!(state.is_enabled("x").await.unwrap());
        assert_eq!(state.last_run("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn persists_under_job_keys() {
        let (state, kv) = store();
        state.set_enabled("source-sync", false).await.unwrap();
        state.set_last_run("source-sync", 42).await.unwrap();

        assert_eq!(
            kv.get("job:source-sync:enabled").await.unwrap().as_deref(),
            Some("false")
        );
        assert_eq!(
            kv.get("job:source-sync:lastRun").await.unwrap().as_deref(),
            Some("42")
        );
        assert!(!state.is_enabled("source-sync").await.unwrap());
        assert_eq!(state.last_run("source-sync").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn garbage_last_run_reads_as_never() {
        let (state, kv) = store();
        kv.put("job:a:lastRun", "soon", None).await.unwrap();
        assert_eq!(state.last_run("a").await.unwrap(), None);
    }
}
