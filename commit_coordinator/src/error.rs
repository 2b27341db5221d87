//! Error types for commit_coordinator.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::{
    transaction::RecordId,
    tx_id::{RequestId, TransactionId},
    tx_log::ValidationResult,
};

/// Result type for commit_coordinator operations.
pub type Result<T> = std::result::Result<T, CommitError>;

/// Errors that can occur while coordinating a replicated commit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommitError {
    /// A unique index key is already assigned to another record.
    #[error(
        "cannot index record {incoming}: found duplicated key '{}' in index '{index}' previously assigned to the record {existing}",
        .key.as_deref().unwrap_or("null")
    )]
    DuplicateKey {
        index: String,
        key: Option<String>,
        existing: RecordId,
        incoming: RecordId,
    },

    /// The stored record version differs from the writer's view.
    #[error(
        "concurrent modification on record {rid}: stored version {stored_version}, expected version {expected_version}"
    )]
    ConcurrentModification {
        rid: RecordId,
        stored_version: u32,
        expected_version: u32,
    },

    /// Record id allocation does not match across replicas, or the record is
    /// not visible on this node yet (`actual` is then `#-1:-1`).
    #[error("concurrent create: expected record {expected}, actual {actual}")]
    ConcurrentCreate { expected: RecordId, actual: RecordId },

    /// Lock wait exceeded the configured timeout.
    #[error("timed out after {waited_ms}ms waiting for lock '{key}' held by request {holder}")]
    LockTimeout {
        key: String,
        holder: RequestId,
        waited_ms: u64,
    },

    /// Fewer nodes are reachable than the write quorum requires.
    #[error(
        "not enough nodes online to execute the operation: available nodes {online:?}, quorum {quorum}"
    )]
    InsufficientNodes {
        quorum: usize,
        available: usize,
        online: BTreeSet<String>,
    },

    /// A broadcast did not collect enough matching responses.
    #[error("request {request} didn't reach the quorum of {quorum}, responses: [{}]", .responses.join(", "))]
    QuorumNotReached {
        request: RequestId,
        quorum: usize,
        responses: Vec<String>,
    },

    /// Transaction id is out of order for its origin.
    #[error("invalid transaction sequence for {tx_id}: {result:?}")]
    InvalidSequence {
        tx_id: TransactionId,
        result: ValidationResult,
    },

    /// Transaction id has already been committed.
    #[error("transaction {0} already committed")]
    AlreadyPresent(TransactionId),

    /// Record failed local constraints. Deterministic, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The local node cannot reach the cluster.
    #[error("node offline: {0}")]
    NodeOffline(String),

    /// Storage engine failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Retry budget spent on an operation that has no further escalation.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CommitError>,
    },
}

impl CommitError {
    /// Conflicts that may disappear when the attempt is repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommitError::ConcurrentCreate { .. }
            | CommitError::ConcurrentModification { .. }
            | CommitError::LockTimeout { .. } => true,
            CommitError::InvalidSequence { result, .. } => matches!(
                result,
                ValidationResult::MissingPrevious | ValidationResult::AlreadyPromised
            ),
            _ => false,
        }
    }

    /// Whether a participant should hand the request back for re-delivery.
    ///
    /// Only conflicts where this replica is behind the writer qualify: a writer
    /// holding a stale version or a position already taken will not succeed
    /// by waiting.
    pub fn should_requeue(&self) -> bool {
        match self {
            CommitError::ConcurrentModification {
                stored_version,
                expected_version,
                ..
            } => expected_version > stored_version,
            CommitError::ConcurrentCreate { expected, actual } => {
                expected.position > actual.position
            },
            CommitError::InvalidSequence { .. } => self.is_retryable(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CommitError::DuplicateKey { .. }
                | CommitError::ConcurrentModification { .. }
                | CommitError::ConcurrentCreate { .. }
        )
    }
}

impl From<bincode::Error> for CommitError {
    fn from(err: bincode::Error) -> Self {
        CommitError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CommitError {
    fn from(err: std::io::Error) -> Self {
        CommitError::Storage(err.to_string())
    }
}
