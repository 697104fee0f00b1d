//! Read-only access to the external source of record.

pub mod http;
pub mod pool;
pub mod row;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sitesync_core::types::ExternalEmployee;

pub use http::HttpSourceConnector;
pub use pool::ConnectionPool;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("source {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("source query failed: {0}")]
    Query(String),
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Unreachable(_) => "SOURCE_UNREACHABLE",
            SourceError::Timeout { .. } => "SOURCE_TIMEOUT",
            SourceError::Query(_) => "SOURCE_QUERY_FAILED",
        }
    }
}

/// One page of the "all employees" listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeePage {
    pub employees: Vec<ExternalEmployee>,
    pub total: u64,
}

/// A live handle to the source.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    async fn ping(&self) -> Result<(), SourceError>;

    /// Every employee of the configured site, oldest update first. With
    /// `since` (`YYYY-MM-DD HH:MM:SS`, source-local time) only rows updated
    /// strictly after it.
    async fn fetch_employees(&self, since: Option<&str>) -> Result<Vec<ExternalEmployee>, SourceError>;

    /// Employees ordered by code, `limit` rows starting at `offset`.
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<EmployeePage, SourceError>;

    async fn close(&self);
}

/// Opens new connections for the pool.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn SourceConnection>, SourceError>;
}
