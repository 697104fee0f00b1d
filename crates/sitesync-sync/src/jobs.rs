//! Scheduled entry points for the sync and their job registry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use sitesync_core::config::SyncConfig;
use sitesync_core::types::SyncType;
use sitesync_core::{Clock, KvStore};
use sitesync_scheduler::{JobDefinition, JobError, JobHandler, JobRegistry, JobSchedule};

use crate::alert::{build_source_down_alert, AlertNotifier};
use crate::error::SyncError;
use crate::failure::{FailureOptions, FailureRecorder};
use crate::orchestrator::{
    SyncOrchestrator, SyncOutcome, FULL_SYNC_LOCK, INCREMENTAL_SYNC_LOCK, LAST_FULL_SYNC_KEY,
};
use crate::retry::with_retry;
use crate::source::ConnectionPool;

pub const SOURCE_SYNC_JOB: &str = "source-sync";
pub const FULL_SYNC_DAILY_JOB: &str = "source-full-sync-daily";
pub const CONNECTION_CLEANUP_JOB: &str = "source-connection-cleanup";

const SOURCE_SYNC_INTERVAL_MS: u64 = 5 * 60 * 1000;
const CONNECTION_CLEANUP_INTERVAL_MS: u64 = 60 * 1000;
const FULL_SYNC_KST_HOUR: u8 = 21;

/// Entry-point retry counts, layered above the fetch retry inside each sync.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub full_attempts: u32,
    pub incremental_attempts: u32,
    pub base_delay_ms: u64,
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            full_attempts: cfg.full_retry_attempts,
            incremental_attempts: cfg.incremental_retry_attempts,
            base_delay_ms: cfg.retry_base_delay_ms,
        }
    }
}

/// Wraps the orchestrator with entry-point retry, failure persistence and
/// the source-down alert.
pub struct SyncRunner {
    orchestrator: Arc<SyncOrchestrator>,
    failures: Arc<FailureRecorder>,
    alerts: Arc<AlertNotifier>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl SyncRunner {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        failures: Arc<FailureRecorder>,
        alerts: Arc<AlertNotifier>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            failures,
            alerts,
            kv,
            clock,
            policy,
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Five-minute job body: a full sync until one has completed, then
    /// incremental syncs.
    pub async fn run_scheduled_sync(&self) -> Result<Option<SyncOutcome>, JobError> {
        let bootstrapped = self
            .kv
            .get(LAST_FULL_SYNC_KEY)
            .await
            .map_err(|e| JobError::new("KV_ERROR", e.to_string()))?
            .is_some();
        if bootstrapped {
            Ok(self.run_incremental_with_recovery().await)
        } else {
            info!("no completed full sync on record, running bootstrap full sync");
            Ok(self.run_full_with_recovery().await)
        }
    }

    /// Full sync with retry. On final failure the error is recorded and
    /// alerted, and `None` is returned.
    pub async fn run_full_with_recovery(&self) -> Option<SyncOutcome> {
        let orchestrator = self.orchestrator.as_ref();
        let result = with_retry(
            move || orchestrator.run_full_sync(),
            self.policy.full_attempts,
            self.policy.base_delay_ms,
        )
        .await;
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.report_failure("FULL_SYNC_FAILED", &e, FULL_SYNC_LOCK).await;
                None
            }
        }
    }

    pub async fn run_incremental_with_recovery(&self) -> Option<SyncOutcome> {
        let orchestrator = self.orchestrator.as_ref();
        let result = with_retry(
            move || orchestrator.run_incremental_sync(),
            self.policy.incremental_attempts,
            self.policy.base_delay_ms,
        )
        .await;
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.report_failure(e.code(), &e, INCREMENTAL_SYNC_LOCK).await;
                None
            }
        }
    }

    async fn report_failure(&self, code: &str, err: &SyncError, lock_name: &str) {
        error!(code, cause = err.code(), lock = lock_name, error = %err, "scheduled sync failed after retries");
        let message = err.to_string();
        self.failures
            .persist(FailureOptions {
                sync_type: SyncType::SourceWorker,
                error_code: code.to_string(),
                error_message: message.clone(),
                lock_name: lock_name.to_string(),
                set_source_down: true,
            })
            .await;
        self.alerts
            .fire(&build_source_down_alert(&message, self.clock.as_ref()))
            .await;
    }
}

struct ScheduledSyncJob {
    runner: Option<Arc<SyncRunner>>,
}

#[async_trait]
impl JobHandler for ScheduledSyncJob {
    async fn run(&self) -> Result<(), JobError> {
        let Some(runner) = &self.runner else {
            info!(job = SOURCE_SYNC_JOB, "source not configured, skipping");
            return Ok(());
        };
        runner.run_scheduled_sync().await.map(|_| ())
    }
}

struct DailyFullSyncJob {
    runner: Option<Arc<SyncRunner>>,
}

#[async_trait]
impl JobHandler for DailyFullSyncJob {
    async fn run(&self) -> Result<(), JobError> {
        let Some(runner) = &self.runner else {
            info!(job = FULL_SYNC_DAILY_JOB, "source not configured, skipping");
            return Ok(());
        };
        runner.run_full_with_recovery().await;
        Ok(())
    }
}

struct ConnectionCleanupJob {
    pool: Option<Arc<ConnectionPool>>,
}

#[async_trait]
impl JobHandler for ConnectionCleanupJob {
    async fn run(&self) -> Result<(), JobError> {
        if let Some(pool) = &self.pool {
            let evicted = pool.cleanup_expired().await;
            if evicted > 0 {
                info!(evicted, "closed idle source connection");
            }
        }
        Ok(())
    }
}

/// The fixed job set. Without a runner (no source configured) the sync jobs
/// are still listed but log and skip.
pub fn build_registry(runner: Option<Arc<SyncRunner>>) -> JobRegistry {
    let pool = runner.as_ref().map(|r| r.orchestrator().pool().clone());
    JobRegistry::new(vec![
        JobDefinition::new(
            SOURCE_SYNC_JOB,
            JobSchedule::interval(SOURCE_SYNC_INTERVAL_MS),
            Arc::new(ScheduledSyncJob {
                runner: runner.clone(),
            }),
        ),
        JobDefinition::new(
            FULL_SYNC_DAILY_JOB,
            JobSchedule::daily_at_kst(FULL_SYNC_KST_HOUR),
            Arc::new(DailyFullSyncJob { runner }),
        ),
        JobDefinition::new(
            CONNECTION_CLEANUP_JOB,
            JobSchedule::interval(CONNECTION_CLEANUP_INTERVAL_MS),
            Arc::new(ConnectionCleanupJob { pool }),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_and_schedules() {
        let registry = build_registry(None);
        let names: Vec<_> = registry.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![SOURCE_SYNC_JOB, FULL_SYNC_DAILY_JOB, CONNECTION_CLEANUP_JOB]
        );
        let daily = registry.find(FULL_SYNC_DAILY_JOB).unwrap();
        assert_eq!(daily.schedule.kst_hour, Some(21));
        assert!(daily.schedule.is_windowed());
        assert_eq!(
            registry.find(SOURCE_SYNC_JOB).unwrap().schedule.interval_ms,
            300_000
        );
    }

    #[tokio::test]
    async fn unconfigured_jobs_skip_cleanly() {
        let registry = build_registry(None);
        for job in registry.iter() {
            job.handler.run().await.unwrap();
        }
    }
}
