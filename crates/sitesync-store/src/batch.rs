//! Chunked execution of write operations against a store whose atomic batch
//! accepts a bounded number of statements.
//!
//! Chunks run in order. A failed chunk is recorded and execution continues;
//! only a run in which *every* chunk failed is surfaced as an error. Callers
//! must inspect [`BatchOutcome::failed_chunks`] to detect partial failure.

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::StoreError;

/// A store that can apply a slice of operations all-or-nothing.
pub trait AtomicBatch {
    type Op;

    fn apply_atomic(&self, ops: &[Self::Op]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total_ops: usize,
    pub completed_ops: usize,
    pub failed_chunks: usize,
    pub errors: Vec<ChunkFailure>,
}

impl BatchOutcome {
    pub fn is_partial(&self) -> bool {
        self.failed_chunks > 0
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("all {chunks} batch chunks failed; first error: {first}")]
    AllChunksFailed {
        chunks: usize,
        first: String,
        errors: Vec<ChunkFailure>,
    },

    #[error("chunk limit must be at least 1")]
    InvalidChunkLimit,
}

impl BatchError {
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::AllChunksFailed { .. } => "ALL_CHUNKS_FAILED",
            BatchError::InvalidChunkLimit => "INVALID_CHUNK_LIMIT",
        }
    }
}

/// Split `ops` into `ceil(len / chunk_limit)` chunks and apply each atomically.
///
/// Empty input performs no store calls and returns an all-zero outcome.
pub fn execute_chunked<B>(
    sink: &B,
    ops: &[B::Op],
    chunk_limit: usize,
) -> Result<BatchOutcome, BatchError>
where
    B: AtomicBatch + ?Sized,
{
    if chunk_limit == 0 {
        return Err(BatchError::InvalidChunkLimit);
    }

    let mut outcome = BatchOutcome {
        total_ops: ops.len(),
        ..Default::default()
    };
    if ops.is_empty() {
        return Ok(outcome);
    }

    let mut chunks = 0usize;
    for (chunk_index, chunk) in ops.chunks(chunk_limit).enumerate() {
        chunks += 1;
        match sink.apply_atomic(chunk) {
            Ok(()) => {
                outcome.completed_ops += chunk.len();
                debug!(chunk_index, size = chunk.len(), "batch chunk applied");
            }
            Err(e) => {
                warn!(chunk_index, size = chunk.len(), error = %e, "batch chunk failed");
                outcome.failed_chunks += 1;
                outcome.errors.push(ChunkFailure {
                    chunk_index,
                    error: e.to_string(),
                });
            }
        }
    }

    if outcome.failed_chunks == chunks {
        let first = outcome
            .errors
            .first()
            .map(|f| f.error.clone())
            .unwrap_or_default();
        return Err(BatchError::AllChunksFailed {
            chunks,
            first,
            errors: outcome.errors,
        });
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records every chunk it sees; fails the chunk indices listed in `fail_on`.
    struct Recorder {
        calls: RefCell<Vec<usize>>,
        fail_on: Vec<usize>,
    }

    impl Recorder {
        fn new(fail_on: Vec<usize>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on,
            }
        }
    }

    impl AtomicBatch for Recorder {
        type Op = u32;

        fn apply_atomic(&self, ops: &[u32]) -> Result<(), StoreError> {
            let index = self.calls.borrow().len();
            self.calls.borrow_mut().push(ops.len());
            if self.fail_on.contains(&index) {
                return Err(StoreError::Poisoned);
            }
            Ok(())
        }
    }

    #[test]
    fn empty_input_makes_no_calls() {
        let sink = Recorder::new(vec![]);
        let out = execute_chunked(&sink, &[], 100).unwrap();
        assert_eq!(out, BatchOutcome::default());
        assert!(sink.calls.borrow().is_empty());
    }

    #[test]
    fn splits_into_ceil_chunks() {
        let sink = Recorder::new(vec![]);
        let ops: Vec<u32> = (0..250).collect();
        let out = execute_chunked(&sink, &ops, 100).unwrap();
        assert_eq!(*sink.calls.borrow(), vec![100, 100, 50]);
        assert_eq!(out.total_ops, 250);
        assert_eq!(out.completed_ops, 250);
        assert_eq!(out.failed_chunks, 0);
    }

    #[test]
    fn middle_chunk_failure_is_partial_not_error() {
        let sink = Recorder::new(vec![1]);
        let ops: Vec<u32> = (0..250).collect();
        let out = execute_chunked(&sink, &ops, 100).unwrap();
        assert_eq!(out.total_ops, 250);
        assert_eq!(out.completed_ops, 150);
        assert_eq!(out.failed_chunks, 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].chunk_index, 1);
        assert!(out.is_partial());
        // Later chunks still ran.
        assert_eq!(sink.calls.borrow().len(), 3);
    }

    #[test]
    fn every_chunk_failing_is_an_error() {
        let sink = Recorder::new(vec![0, 1]);
        let ops: Vec<u32> = (0..150).collect();
        let err = execute_chunked(&sink, &ops, 100).unwrap_err();
        assert_eq!(err.code(), "ALL_CHUNKS_FAILED");
        match err {
            BatchError::AllChunksFailed { chunks, errors, .. } => {
                assert_eq!(chunks, 2);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn single_failing_chunk_is_all_failed() {
        let sink = Recorder::new(vec![0]);
        let err = execute_chunked(&sink, &[1, 2, 3], 100).unwrap_err();
        assert!(matches!(err, BatchError::AllChunksFailed { chunks: 1, .. }));
    }

    #[test]
    fn zero_limit_rejected() {
        let sink = Recorder::new(vec![]);
        assert!(matches!(
            execute_chunked(&sink, &[1], 0),
            Err(BatchError::InvalidChunkLimit)
        ));
    }
}
