use sitesync_core::KvError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persisted run state could not be read or written.
    #[error("Job state error: {0}")]
    Kv(#[from] KvError),

    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// The scheduler actor has stopped and no longer answers control requests.
    #[error("scheduler is not running")]
    Unavailable,
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Kv(_) => "KV_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Unavailable => "SCHEDULER_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure returned by a job handler. Logged by the scheduler, never fatal.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
