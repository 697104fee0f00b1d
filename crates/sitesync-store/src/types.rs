use serde::{Deserialize, Serialize};

/// Default role and status for site memberships created by the sync.
pub const MEMBERSHIP_ROLE_WORKER: &str = "WORKER";
pub const MEMBERSHIP_STATUS_ACTIVE: &str = "ACTIVE";

/// Well-known id of the system actor that audit records are attributed to.
pub const SYSTEM_USER_ID: &str = "system";

/// Row projection of `users` used by the matching logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub name: String,
    pub name_masked: String,
    pub phone_hash: Option<String>,
    pub external_system: Option<String>,
    pub external_worker_id: Option<String>,
    pub company_name: Option<String>,
    pub trade_type: Option<String>,
    pub active: bool,
    pub deactivated_at: Option<String>,
}

/// Hash plus ciphertext of one PII value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedValue {
    pub hash: String,
    pub encrypted: String,
}

/// Fields the sync writes onto a user row.
///
/// On insert, `phone` / `dob` of `None` are stored as NULL. On update they
/// leave the existing columns untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserFields {
    pub name: String,
    pub name_masked: String,
    pub company_name: Option<String>,
    pub trade_type: Option<String>,
    pub phone: Option<ProtectedValue>,
    pub dob: Option<ProtectedValue>,
}

/// One write in an atomic store batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// New active user linked to an external worker id.
    InsertUser {
        id: String,
        external_worker_id: String,
        fields: UserFields,
    },
    /// Refresh an existing user and (re)link it to `external_worker_id`.
    /// Reactivates the user if it had been deactivated.
    UpdateUser {
        id: String,
        external_worker_id: String,
        fields: UserFields,
    },
    DeactivateUser {
        id: String,
    },
    InsertMembership {
        user_id: String,
        site_id: String,
    },
}

/// Row of `sync_errors`, as read back for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorRow {
    pub id: i64,
    pub sync_type: String,
    pub status: String,
    pub error_code: String,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Row of `audit_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor_id: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub reason: serde_json::Value,
    pub created_at: String,
}
