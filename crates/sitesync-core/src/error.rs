use thiserror::Error;

use crate::kv::KvError;

#[derive(Debug, Error)]
pub enum SitesyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SitesyncError {
    /// Short error code string for structured error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SitesyncError::Config(_) => "CONFIG_ERROR",
            SitesyncError::Kv(_) => "KV_ERROR",
            SitesyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SitesyncError::Io(_) => "IO_ERROR",
            SitesyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SitesyncError>;
