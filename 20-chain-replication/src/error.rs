//! Error types surfaced by replicas and by the replicated table.

use std::time::Duration;

use thiserror::Error;

use crate::row::RowKey;

/// Failures reported by a single replica backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    /// The supplied concurrency token no longer matches the stored copy.
    #[error("concurrency token mismatch")]
    ConcurrencyConflict,
    /// The backend refused or failed the request.
    #[error("replica unavailable: {0}")]
    Unavailable(String),
    /// Every retry of a token-guarded write lost to another writer.
    #[error("write kept losing to concurrent writers")]
    Contended,
}

/// Errors returned by [`crate::table::ReplicatedTable`] operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The caller's expected version does not match the head, or another
    /// writer currently holds the row. Re-read and retry.
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: RowKey,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("row {0} not found")]
    NotFound(RowKey),

    #[error("row {key} already exists at version {version}")]
    AlreadyExists { key: RowKey, version: u64 },

    /// A hop did not answer within its timeout. The write may or may not have
    /// landed; re-query with `read`, which repairs the chain.
    #[error("replica {replica} did not answer within {timeout:?} for {key}")]
    ReplicaUnreachable {
        key: RowKey,
        replica: String,
        timeout: Duration,
    },

    /// A replica answered a read, or the head's write, with a definite error.
    /// No write was applied.
    #[error("replica {replica} rejected request for {key}: {reason}")]
    ReplicaFailed {
        key: RowKey,
        replica: String,
        reason: ReplicaError,
    },

    /// Head accepted the write but a later hop failed definitively. The row is
    /// queued for repair.
    #[error("write of {key} v{version} halted at {replica}: {reason}")]
    PartiallyApplied {
        key: RowKey,
        version: u64,
        replica: String,
        reason: ReplicaError,
    },

    /// Repair could not bring every replica up to the head's copy.
    #[error("chain inconsistent for {key}: replica {replica} could not be reconciled ({reason})")]
    ChainInconsistent {
        key: RowKey,
        replica: String,
        reason: String,
    },

    /// The stored row was written by a newer view than the one in use.
    #[error("row {key} was written by view {row_view}, current view is {current_view}")]
    StaleView {
        key: RowKey,
        row_view: u64,
        current_view: u64,
    },

    #[error("propagation task failed: {0}")]
    Propagation(#[from] tokio::task::JoinError),
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;
