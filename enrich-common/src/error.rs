use std::time;

use thiserror::Error;

/// A single external operation failed. Transient and malformed failures are retried by the
/// retry-call strategy; permanent ones are not.
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<time::Duration>,
    },
    #[error("malformed response: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        OperationError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, OperationError::Permanent(_))
    }

    /// The interval the remote end asked us to wait, if any.
    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            OperationError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// An event's operation failed for good, after `attempts` tries.
#[derive(Error, Debug)]
#[error("operation for event {eid} failed after {attempts} attempts: {source}")]
pub struct OperationFailed {
    pub eid: u64,
    pub attempts: u32,
    #[source]
    pub source: OperationError,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read from upstream: {0}")]
    Read(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write output: {0}")]
    Write(String),
    #[error("failed to flush outputs: {0}")]
    Flush(String),
    #[error("sink is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to advance checkpoint to {position}: {message}")]
    Advance { position: u64, message: String },
    #[error("failed to finish checkpoint: {0}")]
    Finish(String),
    #[error("checkpoint store is gone")]
    Gone,
}

#[derive(Error, Debug)]
pub enum RowSourceError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("column {column} has unsupported type {type_name}")]
    UnsupportedColumn { column: String, type_name: String },
    #[error("row has no column {0}")]
    MissingColumn(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {index} is out of range for a batch of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("slot {0} was already filled")]
    AlreadyFilled(usize),
}

/// Errors that abort the batch in flight. None of them advance the checkpoint.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("sub-query for field {field} failed: {source}")]
    SubQuery {
        field: String,
        #[source]
        source: RowSourceError,
    },
    #[error("indirect lookup for key class {key_class} failed: {source}")]
    IndirectLookup {
        key_class: String,
        #[source]
        source: RowSourceError,
    },
    #[error(transparent)]
    OperationFailed(#[from] OperationFailed),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("downstream flush was not acknowledged within {0:?}")]
    FlushTimeout(time::Duration),
    #[error("batch finished with {unresolved} of {total} outputs unresolved")]
    IncompleteBatch { unresolved: usize, total: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
