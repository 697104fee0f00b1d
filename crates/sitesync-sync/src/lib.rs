//! `sitesync-sync` — reconciliation of the external employee source into the
//! local store, plus the retry, lock, alerting and failure-recording pieces
//! the scheduled jobs are built from.

pub mod alert;
pub mod error;
pub mod failure;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod pii;
pub mod retry;
pub mod source;

pub use alert::{build_source_down_alert, Alert, AlertNotifier, AlertSeverity};
pub use error::{Result, SyncError};
pub use failure::{FailureOptions, FailureRecorder};
pub use jobs::{build_registry, RetryPolicy, SyncRunner};
pub use lock::{DistributedLock, LockAcquisition};
pub use orchestrator::{SyncOrchestrator, SyncOutcome, SyncReport, SyncSettings};
pub use pii::PiiProtector;
pub use retry::with_retry;
pub use source::{ConnectionPool, HttpSourceConnector, SourceConnection, SourceConnector, SourceError};
