pub mod batch;
pub mod db;
pub mod error;
pub mod kv;
pub mod store;
pub mod types;

pub use batch::{execute_chunked, AtomicBatch, BatchError, BatchOutcome, ChunkFailure};
pub use error::StoreError;
pub use kv::SqliteKvStore;
pub use store::LocalStore;
