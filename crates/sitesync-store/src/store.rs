use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use tracing::debug;

use sitesync_core::types::{SyncFailureRecord, EXTERNAL_SYSTEM};

use crate::batch::AtomicBatch;
use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::*;

/// SQLite caps bound parameters per statement; id lists are queried in slices.
const MAX_IN_PARAMS: usize = 500;
/// Membership existence is checked 50 users at a time.
const MEMBERSHIP_LOOKUP_CHUNK: usize = 50;

const USER_COLUMNS: &str = "id, name, name_masked, phone_hash, external_system, external_worker_id,
     company_name, trade_type, active, deactivated_at";

/// Local application store: users, sites, memberships, sync errors and audit log.
///
/// Thread-safe: the connection sits behind a Mutex, matching how the rest of
/// the workspace shares a single SQLite handle.
pub struct LocalStore {
    db: Mutex<Connection>,
}

impl LocalStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    #[cfg(test)]
    pub fn get_user(&self, id: &str) -> Result<Option<LocalUser>> {
        let db = self.db()?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        Ok(db.query_row(&sql, params![id], row_to_user).optional()?)
    }

    /// Point lookup by `(external_system, external_worker_id)`, active or not.
    pub fn find_user_by_external_id(&self, worker_id: &str) -> Result<Option<LocalUser>> {
        let db = self.db()?;
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE external_system = ?1 AND external_worker_id = ?2"
        );
        Ok(db
            .query_row(&sql, params![EXTERNAL_SYSTEM, worker_id], row_to_user)
            .optional()?)
    }

    pub fn find_user_by_phone_hash(&self, phone_hash: &str) -> Result<Option<LocalUser>> {
        let db = self.db()?;
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE phone_hash = ?1
             ORDER BY created_at ASC LIMIT 1"
        );
        Ok(db
            .query_row(&sql, params![phone_hash], row_to_user)
            .optional()?)
    }

    /// Active users linked to the external system whose worker id is in `worker_ids`.
    pub fn active_users_by_external_ids(&self, worker_ids: &[String]) -> Result<Vec<LocalUser>> {
        let db = self.db()?;
        let mut users = Vec::new();
        for slice in worker_ids.chunks(MAX_IN_PARAMS) {
            let placeholders = (0..slice.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE active = 1 AND external_system = ?1
                 AND external_worker_id IN ({placeholders})"
            );
            let mut stmt = db.prepare(&sql)?;
            let args = std::iter::once(EXTERNAL_SYSTEM.to_string()).chain(slice.iter().cloned());
            let rows = stmt.query_map(params_from_iter(args), row_to_user)?;
            for row in rows {
                users.push(row?);
            }
        }
        Ok(users)
    }

    /// Every active user linked to the external system.
    pub fn active_external_users(&self) -> Result<Vec<LocalUser>> {
        let db = self.db()?;
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE active = 1 AND external_system = ?1
             ORDER BY created_at ASC"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![EXTERNAL_SYSTEM], row_to_user)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    pub fn upsert_site(&self, id: &str, name: &str, active: bool) -> Result<()> {
        let db = self.db()?;
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO sites (id, name, active, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![id, name, active as i64, now],
        )?;
        Ok(())
    }

    pub fn active_site_ids(&self) -> Result<Vec<String>> {
        let db = self.db()?;
        let mut stmt = db.prepare("SELECT id FROM sites WHERE active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    #[cfg(test)]
    pub fn membership_exists(&self, user_id: &str, site_id: &str) -> Result<bool> {
        let db = self.db()?;
        let found: Option<i64> = db
            .query_row(
                "SELECT 1 FROM site_memberships WHERE user_id = ?1 AND site_id = ?2",
                params![user_id, site_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Which of `user_ids` already hold a membership of `site_id`.
    pub fn members_among(&self, site_id: &str, user_ids: &[String]) -> Result<HashSet<String>> {
        let db = self.db()?;
        let mut found = HashSet::new();
        for slice in user_ids.chunks(MEMBERSHIP_LOOKUP_CHUNK) {
            let placeholders = (0..slice.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT user_id FROM site_memberships
                 WHERE site_id = ?1 AND user_id IN ({placeholders})"
            );
            let mut stmt = db.prepare(&sql)?;
            let args = std::iter::once(site_id.to_string()).chain(slice.iter().cloned());
            let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
            for row in rows {
                found.insert(row?);
            }
        }
        Ok(found)
    }

    /// Site ids the user is a member of.
    pub fn memberships_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let db = self.db()?;
        let mut stmt = db.prepare(
            "SELECT site_id FROM site_memberships WHERE user_id = ?1 ORDER BY site_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Append one failure record. Never updates existing rows.
    pub fn insert_sync_failure(&self, record: &SyncFailureRecord) -> Result<i64> {
        let db = self.db()?;
        let payload = json!({
            "timestamp": record.timestamp,
            "correlationId": record.correlation_id,
            "lockName": record.lock_name,
        });
        db.execute(
            "INSERT INTO sync_errors (sync_type, status, error_code, error_message, payload, created_at)
             VALUES (?1, 'OPEN', ?2, ?3, ?4, ?5)",
            params![
                record.sync_type.to_string(),
                record.error_code,
                record.error_message,
                serde_json::to_string(&payload)?,
                record.timestamp,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn sync_failures(&self) -> Result<Vec<SyncErrorRow>> {
        let db = self.db()?;
        let mut stmt = db.prepare(
            "SELECT id, sync_type, status, error_code, error_message, payload, created_at
             FROM sync_errors ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, sync_type, status, error_code, error_message, payload, created_at) = row?;
            out.push(SyncErrorRow {
                id,
                sync_type,
                status,
                error_code,
                error_message,
                payload: serde_json::from_str(&payload)?,
                created_at,
            });
        }
        Ok(out)
    }

    /// Id of the SYSTEM actor, creating its user row on first use.
    pub fn ensure_system_user(&self) -> Result<String> {
        let db = self.db()?;
        let now = chrono::Utc::now().to_rfc3339();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO users (id, name, name_masked, role, active, created_at, updated_at)
             VALUES (?1, 'SYSTEM', 'SYSTEM', 'SYSTEM', 1, ?2, ?2)",
            params![SYSTEM_USER_ID, now],
        )?;
        if inserted > 0 {
            debug!("created system user");
        }
        Ok(SYSTEM_USER_ID.to_string())
    }

    pub fn append_audit(
        &self,
        actor_id: &str,
        action: &str,
        target_type: &str,
        target_id: &str,
        reason: &serde_json::Value,
    ) -> Result<i64> {
        let db = self.db()?;
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO audit_logs (actor_id, action, target_type, target_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                actor_id,
                action,
                target_type,
                target_id,
                serde_json::to_string(reason)?,
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn audit_entries(&self, action: &str) -> Result<Vec<AuditEntry>> {
        let db = self.db()?;
        let mut stmt = db.prepare(
            "SELECT id, actor_id, action, target_type, target_id, reason, created_at
             FROM audit_logs WHERE action = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![action], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, actor_id, action, target_type, target_id, reason, created_at) = row?;
            out.push(AuditEntry {
                id,
                actor_id,
                action,
                target_type,
                target_id,
                reason: serde_json::from_str(&reason)?,
                created_at,
            });
        }
        Ok(out)
    }
}

impl AtomicBatch for LocalStore {
    type Op = WriteOp;

    /// Apply every op inside one transaction; any failure rolls the chunk back.
    fn apply_atomic(&self, ops: &[WriteOp]) -> Result<()> {
        let mut db = self.db()?;
        let tx = db.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        for op in ops {
            apply_op(&tx, op, &now)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn apply_op(conn: &Connection, op: &WriteOp, now: &str) -> Result<()> {
    match op {
        WriteOp::InsertUser {
            id,
            external_worker_id,
            fields,
        } => {
            conn.execute(
                "INSERT INTO users (id, name, name_masked, phone_hash, phone_encrypted,
                     dob_hash, dob_encrypted, company_name, trade_type,
                     external_system, external_worker_id, role, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'WORKER', 1, ?12, ?12)",
                params![
                    id,
                    fields.name,
                    fields.name_masked,
                    fields.phone.as_ref().map(|p| p.hash.as_str()),
                    fields.phone.as_ref().map(|p| p.encrypted.as_str()),
                    fields.dob.as_ref().map(|d| d.hash.as_str()),
                    fields.dob.as_ref().map(|d| d.encrypted.as_str()),
                    fields.company_name,
                    fields.trade_type,
                    EXTERNAL_SYSTEM,
                    external_worker_id,
                    now,
                ],
            )?;
        }
        WriteOp::UpdateUser {
            id,
            external_worker_id,
            fields,
        } => {
            conn.execute(
                "UPDATE users SET name = ?1, name_masked = ?2, company_name = ?3, trade_type = ?4,
                     external_system = ?5, external_worker_id = ?6,
                     active = 1, deactivated_at = NULL, updated_at = ?7
                 WHERE id = ?8",
                params![
                    fields.name,
                    fields.name_masked,
                    fields.company_name,
                    fields.trade_type,
                    EXTERNAL_SYSTEM,
                    external_worker_id,
                    now,
                    id,
                ],
            )?;
            if let Some(phone) = &fields.phone {
                conn.execute(
                    "UPDATE users SET phone_hash = ?1, phone_encrypted = ?2 WHERE id = ?3",
                    params![phone.hash, phone.encrypted, id],
                )?;
            }
            if let Some(dob) = &fields.dob {
                conn.execute(
                    "UPDATE users SET dob_hash = ?1, dob_encrypted = ?2 WHERE id = ?3",
                    params![dob.hash, dob.encrypted, id],
                )?;
            }
        }
        WriteOp::DeactivateUser { id } => {
            conn.execute(
                "UPDATE users SET active = 0, deactivated_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        WriteOp::InsertMembership { user_id, site_id } => {
            conn.execute(
                "INSERT OR IGNORE INTO site_memberships (user_id, site_id, role, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    site_id,
                    MEMBERSHIP_ROLE_WORKER,
                    MEMBERSHIP_STATUS_ACTIVE,
                    now
                ],
            )?;
        }
    }
    Ok(())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<LocalUser> {
    Ok(LocalUser {
        id: row.get(0)?,
        name: row.get(1)?,
        name_masked: row.get(2)?,
        phone_hash: row.get(3)?,
        external_system: row.get(4)?,
        external_worker_id: row.get(5)?,
        company_name: row.get(6)?,
        trade_type: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        deactivated_at: row.get(9)?,
    })
}
