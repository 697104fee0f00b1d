use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// External system tag stored on every user linked to the source of record.
pub const EXTERNAL_SYSTEM: &str = "EXTERNAL";

/// Source-side state flag for an employee currently on the job.
pub const ACTIVE_STATE_FLAG: &str = "W";

/// One employee row from the external source of record (read-only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEmployee {
    pub employee_code: String,
    pub name: String,
    pub company_code: String,
    pub company_name: String,
    pub phone: String,
    /// First seven characters of the national id (birth date + century digit).
    pub national_id_prefix: String,
    pub job_code: String,
    pub role_code: String,
    pub position_code: String,
    pub state_flag: String,
    pub entry_date: String,
    pub exit_date: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExternalEmployee {
    /// `"W"` is active; every other flag means retired.
    pub fn is_active(&self) -> bool {
        self.state_flag == ACTIVE_STATE_FLAG
    }
}

/// Counts produced by one sync batch. Accumulated, never replaced, across
/// the sub-batches of a full sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    SourceWorker,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::SourceWorker => write!(f, "SOURCE_WORKER"),
        }
    }
}

/// Appended once per failed sync; never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailureRecord {
    pub timestamp: String,
    pub correlation_id: String,
    pub sync_type: SyncType,
    pub error_code: String,
    pub error_message: String,
    pub lock_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_counts_and_errors() {
        let mut total = SyncResult {
            created: 1,
            updated: 2,
            skipped: 0,
            errors: vec!["E-1: boom".to_string()],
        };
        total.merge(SyncResult {
            created: 3,
            updated: 0,
            skipped: 1,
            errors: vec!["E-9: bad".to_string()],
        });
        assert_eq!(total.created, 4);
        assert_eq!(total.updated, 2);
        assert_eq!(total.skipped, 1);
        assert_eq!(total.errors, vec!["E-1: boom", "E-9: bad"]);
    }

    #[test]
    fn failure_record_wire_format() {
        let rec = SyncFailureRecord {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            correlation_id: "c-1".to_string(),
            sync_type: SyncType::SourceWorker,
            error_code: "SOURCE_UNREACHABLE".to_string(),
            error_message: "ping timeout".to_string(),
            lock_name: "source-incremental".to_string(),
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains(r#""syncType":"SOURCE_WORKER""#));
        assert!(json.contains(r#""correlationId":"c-1""#));
        assert!(json.contains(r#""lockName":"source-incremental""#));
    }
}
