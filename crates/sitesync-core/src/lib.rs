//! `sitesync-core` — configuration, errors, clock, key-value contract and the
//! domain types shared by the store, scheduler and sync crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod kv;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SitesyncError};
pub use kv::{KvError, KvStore, MemoryKvStore};
