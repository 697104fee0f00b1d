//! Full and incremental reconciliation of source employees into the local store.
//!
//! Both runs share a prelude: take the advisory lock (skip when held), check
//! the source with a bounded ping, fetch with retry. Writes go through
//! [`execute_chunked`] so one bad chunk never aborts the rest.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use sitesync_core::config::SyncConfig;
use sitesync_core::types::{ExternalEmployee, SyncResult, SyncType};
use sitesync_core::{Clock, KvStore};
use sitesync_store::types::{UserFields, WriteOp};
use sitesync_store::{execute_chunked, LocalStore};

use crate::error::{Result, SyncError};
use crate::failure::{FailureOptions, FailureRecorder, SOURCE_STATUS_KEY};
use crate::lock::DistributedLock;
use crate::pii::{mask_name, national_id_to_dob, normalize_phone, PiiProtector};
use crate::retry::with_retry;
use crate::source::row::format_since;
use crate::source::{ConnectionPool, SourceError};

pub const FULL_SYNC_LOCK: &str = "source-full";
pub const INCREMENTAL_SYNC_LOCK: &str = "source-incremental";
pub const LAST_FULL_SYNC_KEY: &str = "sync:last-full-sync";

/// Source reads inside a sync are retried on their own, below the entry-point retry.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BASE_DELAY_MS: u64 = 1000;

const AUDIT_TARGET_TYPE: &str = "SOURCE_SYNC";

/// Tunables taken from `[sync]`.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub full_batch_size: usize,
    pub write_chunk_limit: usize,
    pub full_lock_ttl_secs: u64,
    pub incremental_lock_ttl_secs: u64,
    pub lookback_secs: u64,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            full_batch_size: cfg.full_batch_size.max(1),
            write_chunk_limit: cfg.write_chunk_limit.max(1),
            full_lock_ttl_secs: cfg.full_lock_ttl_secs,
            incremental_lock_ttl_secs: cfg.incremental_lock_ttl_secs,
            lookback_secs: cfg.lookback_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fetched: usize,
    pub active: usize,
    pub retired: usize,
    #[serde(flatten)]
    pub result: SyncResult,
    pub deactivated: u32,
    pub memberships_created: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another worker holds the lock.
    Skipped { holder: Option<String> },
    Completed(SyncReport),
}

#[derive(Debug, Clone, Copy)]
enum Planned {
    Created,
    Updated,
}

pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    kv: Arc<dyn KvStore>,
    pool: Arc<ConnectionPool>,
    lock: DistributedLock,
    pii: PiiProtector,
    failures: Arc<FailureRecorder>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<LocalStore>,
        kv: Arc<dyn KvStore>,
        pool: Arc<ConnectionPool>,
        pii: PiiProtector,
        failures: Arc<FailureRecorder>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            lock: DistributedLock::new(kv.clone(), clock.clone()),
            store,
            kv,
            pool,
            pii,
            failures,
            clock,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Reconcile the entire employee set. Returns `Skipped` when the
    /// full-sync lock is held elsewhere.
    pub async fn run_full_sync(&self) -> Result<SyncOutcome> {
        let acquired = self
            .lock
            .acquire(FULL_SYNC_LOCK, self.settings.full_lock_ttl_secs)
            .await?;
        if !acquired.acquired {
            info!(lock = FULL_SYNC_LOCK, holder = ?acquired.holder, "full sync already running, skipping");
            return Ok(SyncOutcome::Skipped {
                holder: acquired.holder,
            });
        }

        let result = AssertUnwindSafe(self.full_sync_locked()).catch_unwind().await;
        self.lock.release(FULL_SYNC_LOCK).await;
        let result = match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        match result {
            Ok(report) => Ok(SyncOutcome::Completed(report)),
            Err(e) => {
                error!(
                    sync_type = %SyncType::SourceWorker,
                    code = "FULL_SYNC_FAILED",
                    cause = e.code(),
                    error = %e,
                    "full sync failed"
                );
                Err(e)
            }
        }
    }

    async fn full_sync_locked(&self) -> Result<SyncReport> {
        let actor = self.store.ensure_system_user()?;
        if !self.pool.test_connection().await {
            return Err(SourceError::Unreachable(
                "source connection failed during full sync".to_string(),
            )
            .into());
        }

        let conn = self.pool.get().await?;
        let conn_ref = conn.as_ref();
        let employees = with_retry(
            move || conn_ref.fetch_employees(None),
            FETCH_ATTEMPTS,
            FETCH_BASE_DELAY_MS,
        )
        .await?;

        let mut report = SyncReport {
            fetched: employees.len(),
            ..Default::default()
        };
        if employees.is_empty() {
            info!("full sync: source returned no employees");
            return Ok(report);
        }

        let (active, retired): (Vec<_>, Vec<_>) =
            employees.into_iter().partition(|e| e.is_active());
        report.active = active.len();
        report.retired = retired.len();

        let batches = active.chunks(self.settings.full_batch_size);
        let batch_count = batches.len();
        let mut failed_batches = 0;
        let mut last_err = None;
        for (i, batch) in batches.enumerate() {
            let batch_result = match self.sync_employees(batch) {
                Ok(r) => r,
                Err(e) => {
                    warn!(batch = i, code = e.code(), error = %e, "full sync batch failed");
                    report.result.errors.push(format!("{}: {}", e.code(), e));
                    failed_batches += 1;
                    last_err = Some(e);
                    continue;
                }
            };
            info!(
                batch = i,
                created = batch_result.created,
                updated = batch_result.updated,
                skipped = batch_result.skipped,
                errors = batch_result.errors.len(),
                "full sync batch done"
            );
            report.result.merge(batch_result);
        }
        if failed_batches == batch_count {
            if let Some(e) = last_err {
                return Err(e);
            }
        }

        report.deactivated = self.deactivate_retired(&employee_codes(&retired))?;

        report.memberships_created = match self
            .store
            .active_external_users()
            .map_err(SyncError::from)
            .and_then(|users| {
                let ids: Vec<String> = users.into_iter().map(|u| u.id).collect();
                self.ensure_site_memberships(&ids)
            }) {
            Ok(n) => n,
            Err(e) => {
                error!(code = e.code(), error = %e, "full sync: membership reconciliation failed");
                0
            }
        };

        let finished_at = self.clock.now().to_rfc3339();
        self.kv.put(LAST_FULL_SYNC_KEY, &finished_at, None).await?;
        self.kv.delete(SOURCE_STATUS_KEY).await?;

        self.store.append_audit(
            &actor,
            "SOURCE_FULL_SYNC_COMPLETED",
            AUDIT_TARGET_TYPE,
            "cron-full",
            &json!(&report),
        )?;
        info!(
            fetched = report.fetched,
            created = report.result.created,
            updated = report.result.updated,
            skipped = report.result.skipped,
            deactivated = report.deactivated,
            memberships = report.memberships_created,
            errors = report.result.errors.len(),
            "full sync completed"
        );
        Ok(report)
    }

    /// Reconcile employees updated inside the lookback window. Failures are
    /// recorded (without the source-down flag) and returned.
    pub async fn run_incremental_sync(&self) -> Result<SyncOutcome> {
        let acquired = self
            .lock
            .acquire(INCREMENTAL_SYNC_LOCK, self.settings.incremental_lock_ttl_secs)
            .await?;
        if !acquired.acquired {
            info!(lock = INCREMENTAL_SYNC_LOCK, holder = ?acquired.holder, "incremental sync already running, skipping");
            return Ok(SyncOutcome::Skipped {
                holder: acquired.holder,
            });
        }

        let result = AssertUnwindSafe(self.incremental_sync_locked())
            .catch_unwind()
            .await;
        self.lock.release(INCREMENTAL_SYNC_LOCK).await;
        let result = match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        match result {
            Ok(report) => Ok(SyncOutcome::Completed(report)),
            Err(e) => {
                error!(code = e.code(), error = %e, "incremental sync failed");
                self.failures
                    .persist(FailureOptions {
                        sync_type: SyncType::SourceWorker,
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                        lock_name: INCREMENTAL_SYNC_LOCK.to_string(),
                        set_source_down: false,
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn incremental_sync_locked(&self) -> Result<SyncReport> {
        let actor = self.store.ensure_system_user()?;
        let since = format_since(self.clock.now(), self.settings.lookback_secs);

        if !self.pool.test_connection().await {
            return Err(SourceError::Unreachable(
                "source connection failed during incremental sync".to_string(),
            )
            .into());
        }

        let conn = self.pool.get().await?;
        let (conn_ref, since_ref) = (conn.as_ref(), since.as_str());
        let employees = with_retry(
            move || conn_ref.fetch_employees(Some(since_ref)),
            FETCH_ATTEMPTS,
            FETCH_BASE_DELAY_MS,
        )
        .await?;

        let mut report = SyncReport {
            fetched: employees.len(),
            since: Some(since.clone()),
            ..Default::default()
        };
        if employees.is_empty() {
            if let Err(e) = self.kv.delete(SOURCE_STATUS_KEY).await {
                warn!(error = %e, "failed to clear source status flag");
            }
            info!(since = %since, "incremental sync: no changes");
            return Ok(report);
        }

        let (active, retired): (Vec<_>, Vec<_>) =
            employees.into_iter().partition(|e| e.is_active());
        report.active = active.len();
        report.retired = retired.len();

        report.result = self.sync_employees(&active)?;
        report.deactivated = self.deactivate_retired(&employee_codes(&retired))?;

        let active_codes = employee_codes(&active);
        report.memberships_created = match self
            .store
            .active_users_by_external_ids(&active_codes)
            .map_err(SyncError::from)
            .and_then(|users| {
                let ids: Vec<String> = users.into_iter().map(|u| u.id).collect();
                self.ensure_site_memberships(&ids)
            }) {
            Ok(n) => n,
            Err(e) => {
                error!(code = e.code(), error = %e, "incremental sync: membership reconciliation failed");
                0
            }
        };

        self.store.append_audit(
            &actor,
            "SOURCE_SYNC_COMPLETED",
            AUDIT_TARGET_TYPE,
            "cron",
            &json!(&report),
        )?;
        self.kv.delete(SOURCE_STATUS_KEY).await?;
        info!(
            since = %since,
            fetched = report.fetched,
            created = report.result.created,
            updated = report.result.updated,
            deactivated = report.deactivated,
            "incremental sync completed"
        );
        Ok(report)
    }

    /// Upsert `employees`: match by external id, then by phone hash, else create.
    ///
    /// Per-employee failures land in `errors`; chunk failures are reported as
    /// `BATCH_CHUNK_FAILED` entries. Only a batch in which every chunk failed
    /// returns an error.
    pub fn sync_employees(&self, employees: &[ExternalEmployee]) -> Result<SyncResult> {
        let mut result = SyncResult::default();
        let mut ops = Vec::with_capacity(employees.len());
        let mut planned = Vec::with_capacity(employees.len());
        let mut seen = HashSet::new();
        // phone hash -> employee code that claimed it earlier in this batch
        let mut claimed_phones: HashMap<String, String> = HashMap::new();

        for emp in employees {
            let code = emp.employee_code.trim();
            if code.is_empty() || !seen.insert(code.to_string()) {
                result.skipped += 1;
                continue;
            }
            match self.plan_upsert(code, emp, &mut claimed_phones) {
                Ok((op, kind)) => {
                    ops.push(op);
                    planned.push(kind);
                }
                Err(e) => {
                    warn!(employee = %code, code = e.code(), error = %e, "skipping employee");
                    result.errors.push(format!("{code}: {e}"));
                }
            }
        }

        if ops.is_empty() {
            return Ok(result);
        }

        let limit = self.settings.write_chunk_limit;
        let outcome = execute_chunked(self.store.as_ref(), ops.as_slice(), limit)?;
        let failed: HashSet<usize> = outcome.errors.iter().map(|f| f.chunk_index).collect();
        for (i, kind) in planned.iter().enumerate() {
            if failed.contains(&(i / limit)) {
                continue;
            }
            match kind {
                Planned::Created => result.created += 1,
                Planned::Updated => result.updated += 1,
            }
        }
        for f in &outcome.errors {
            result
                .errors
                .push(format!("BATCH_CHUNK_FAILED: chunk {}: {}", f.chunk_index, f.error));
        }
        Ok(result)
    }

    fn plan_upsert(
        &self,
        code: &str,
        emp: &ExternalEmployee,
        claimed_phones: &mut HashMap<String, String>,
    ) -> Result<(WriteOp, Planned)> {
        let mut fields = self.derive_fields(emp)?;
        let phone_hash = fields.phone.as_ref().map(|p| p.hash.clone());
        let claimed_by_other = |hash: &str, claims: &HashMap<String, String>| {
            claims.get(hash).is_some_and(|owner| owner != code)
        };

        if let Some(existing) = self.store.find_user_by_external_id(code)? {
            if let Some(hash) = &phone_hash {
                let owner = self.store.find_user_by_phone_hash(hash)?;
                let taken = owner.is_some_and(|u| u.id != existing.id)
                    || claimed_by_other(hash, claimed_phones);
                if taken {
                    warn!(employee = %code, "phone belongs to another user, keeping existing phone");
                    fields.phone = None;
                } else {
                    claimed_phones.insert(hash.clone(), code.to_string());
                }
            }
            return Ok((
                WriteOp::UpdateUser {
                    id: existing.id,
                    external_worker_id: code.to_string(),
                    fields,
                },
                Planned::Updated,
            ));
        }

        if let Some(hash) = &phone_hash {
            let by_phone = if claimed_by_other(hash, claimed_phones) {
                None
            } else {
                self.store.find_user_by_phone_hash(hash)?
            };
            match by_phone {
                Some(user)
                    if user
                        .external_worker_id
                        .as_deref()
                        .filter(|linked| !linked.is_empty())
                        .map_or(true, |linked| linked == code) =>
                {
                    claimed_phones.insert(hash.clone(), code.to_string());
                    return Ok((
                        WriteOp::UpdateUser {
                            id: user.id,
                            external_worker_id: code.to_string(),
                            fields,
                        },
                        Planned::Updated,
                    ));
                }
                None if !claimed_by_other(hash, claimed_phones) => {
                    claimed_phones.insert(hash.clone(), code.to_string());
                }
                _ => {
                    warn!(employee = %code, "phone already linked to another worker, creating without PII");
                    fields.phone = None;
                    fields.dob = None;
                }
            }
        }

        Ok((
            WriteOp::InsertUser {
                id: Uuid::new_v4().to_string(),
                external_worker_id: code.to_string(),
                fields,
            },
            Planned::Created,
        ))
    }

    fn derive_fields(&self, emp: &ExternalEmployee) -> Result<UserFields> {
        let name = emp.name.trim().to_string();
        let phone = normalize_phone(&emp.phone);
        let phone = if phone.is_empty() {
            None
        } else {
            Some(self.pii.protect(&phone)?)
        };
        let dob = match national_id_to_dob(&emp.national_id_prefix) {
            Some(dob) => Some(self.pii.protect(&dob)?),
            None => None,
        };
        Ok(UserFields {
            name_masked: mask_name(&name),
            name,
            company_name: non_empty(&emp.company_name),
            trade_type: non_empty(&emp.job_code),
            phone,
            dob,
        })
    }

    /// Deactivate local users linked to the given retired worker codes.
    pub fn deactivate_retired(&self, codes: &[String]) -> Result<u32> {
        if codes.is_empty() {
            return Ok(0);
        }
        let ops: Vec<WriteOp> = self
            .store
            .active_users_by_external_ids(codes)?
            .into_iter()
            .map(|u| WriteOp::DeactivateUser { id: u.id })
            .collect();
        if ops.is_empty() {
            return Ok(0);
        }
        let outcome = execute_chunked(self.store.as_ref(), ops.as_slice(), self.settings.write_chunk_limit)?;
        if outcome.is_partial() {
            warn!(
                failed_chunks = outcome.failed_chunks,
                "some deactivations failed"
            );
        }
        Ok(outcome.completed_ops as u32)
    }

    /// Give every user in `user_ids` a membership of every active site.
    pub fn ensure_site_memberships(&self, user_ids: &[String]) -> Result<u32> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = user_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::new();
        for site_id in self.store.active_site_ids()? {
            let existing = self.store.members_among(&site_id, &ids)?;
            ops.extend(
                ids.iter()
                    .filter(|id| !existing.contains(id.as_str()))
                    .map(|id| WriteOp::InsertMembership {
                        user_id: id.clone(),
                        site_id: site_id.clone(),
                    }),
            );
        }
        if ops.is_empty() {
            return Ok(0);
        }
        let outcome = execute_chunked(self.store.as_ref(), ops.as_slice(), self.settings.write_chunk_limit)?;
        Ok(outcome.completed_ops as u32)
    }
}

fn employee_codes(employees: &[ExternalEmployee]) -> Vec<String> {
    employees
        .iter()
        .map(|e| e.employee_code.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
