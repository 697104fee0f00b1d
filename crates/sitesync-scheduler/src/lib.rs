//! `sitesync-scheduler` — tick-driven job scheduler with persisted run state.
//!
//! # Overview
//!
//! A [`engine::SchedulerEngine`] owns a fixed [`types::JobRegistry`] and wakes
//! once per tick. Each tick walks the registry in order and runs every enabled
//! job that is due, one after another. Run state (`enabled`, `lastRun`) lives
//! in a [`sitesync_core::KvStore`] so it survives restarts.
//!
//! # Due rules
//!
//! | Schedule        | Due when                                                 |
//! |-----------------|----------------------------------------------------------|
//! | interval-only   | never run, or `now - lastRun >= intervalMs`              |
//! | KST window      | inside the window and not yet run in this `YYYY-MM-DD-HH` |

pub mod engine;
pub mod error;
pub mod schedule;
pub mod state;
pub mod types;

pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{JobError, Result, SchedulerError};
pub use types::{JobDefinition, JobHandler, JobInfo, JobRegistry, JobSchedule, JobStatusView};
