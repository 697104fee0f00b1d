use sitesync_core::KvError;
use sitesync_store::{BatchError, StoreError};
use thiserror::Error;

use crate::pii::PiiError;
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error(transparent)]
    Pii(#[from] PiiError),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Source(e) => e.code(),
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::Batch(e) => e.code(),
            SyncError::Kv(_) => "KV_ERROR",
            SyncError::Pii(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
