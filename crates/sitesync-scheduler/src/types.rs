use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// When a job may run.
///
/// With every window field `None` the job is interval-only and re-runs once
/// `interval_ms` has elapsed. Otherwise it runs at most once per matching
/// KST hour window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSchedule {
    pub interval_ms: u64,
    /// KST hour, 0-23.
    pub kst_hour: Option<u8>,
    /// 0 = Sunday … 6 = Saturday, in KST.
    pub day_of_week: Option<u8>,
    /// 1-31, in KST.
    pub day_of_month: Option<u8>,
}

impl JobSchedule {
    pub fn interval(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            kst_hour: None,
            day_of_week: None,
            day_of_month: None,
        }
    }

    pub fn daily_at_kst(hour: u8) -> Self {
        Self {
            interval_ms: 24 * 60 * 60 * 1000,
            kst_hour: Some(hour),
            day_of_week: None,
            day_of_month: None,
        }
    }

    pub fn is_windowed(&self) -> bool {
        self.kst_hour.is_some() || self.day_of_week.is_some() || self.day_of_month.is_some()
    }
}

/// Work a job performs when it fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> Result<(), JobError>;
}

/// Immutable registry entry, fixed for the lifetime of the process.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: JobSchedule,
    pub handler: Arc<dyn JobHandler>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, schedule: JobSchedule, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            schedule,
            handler,
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            schedule: self.schedule,
        }
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Ordered set of job definitions. Ticks walk it in insertion order.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<JobDefinition>,
}

impl JobRegistry {
    pub fn new(jobs: Vec<JobDefinition>) -> Self {
        Self { jobs }
    }

    pub fn find(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobDefinition> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// `list` output: the registry without handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub name: String,
    #[serde(flatten)]
    pub schedule: JobSchedule,
}

/// `status` output for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub name: String,
    pub enabled: bool,
    pub last_run: Option<i64>,
    pub due_now: bool,
    pub schedule: JobSchedule,
}
