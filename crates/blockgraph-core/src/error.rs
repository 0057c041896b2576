//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::BlockNumber;

/// Errors returned by a [`BlockSource`](crate::source::BlockSource).
///
/// A block that does not exist is not an error: sources return `Ok(None)`,
/// which the cursor treats as reorg evidence.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Network failure, timeout, rate limit. Safe to retry.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The endpoint answered with something we cannot interpret.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors returned by entity and graph store backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend I/O failure. `retryable` is set for connection-level errors.
    #[error("{store} backend error: {reason}")]
    Backend {
        store: String,
        reason: String,
        retryable: bool,
    },

    /// A block was committed out of order.
    #[error("non-sequential commit: expected block {expected}, got {got}")]
    NonSequential { expected: BlockNumber, got: BlockNumber },

    /// A block number that is already committed was offered with another hash.
    #[error("block {number} already committed as {committed}, refusing {offered}")]
    Conflict {
        number: BlockNumber,
        committed: String,
        offered: String,
    },

    /// An operation violates an entity or graph constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// An operation is malformed for the block it was submitted with.
    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The entity store and graph store cannot be brought to the same block.
    #[error("stores diverged: entities at {entities:?}, graph at {graph:?}")]
    Diverged {
        entities: Option<BlockNumber>,
        graph: Option<BlockNumber>,
    },
}

impl StoreError {
    /// Build a non-retryable backend error.
    pub fn backend(store: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            store: store.into(),
            reason: reason.to_string(),
            retryable: false,
        }
    }

    /// Build a retryable backend error.
    pub fn transient(store: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            store: store.into(),
            reason: reason.to_string(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { retryable: true, .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors that can occur while running a dataset pipeline.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("deep reorg below block {oldest_retained} (last processed {last_processed}); no common ancestor in window")]
    DeepReorg {
        last_processed: BlockNumber,
        oldest_retained: BlockNumber,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("mapping error in '{handler}': {reason}")]
    Mapping { handler: String, reason: String },

    #[error("checkpoint at block {checkpoint} is ahead of stores at {stores:?}")]
    CheckpointMismatch {
        checkpoint: BlockNumber,
        stores: Option<BlockNumber>,
    },

    #[error("dataset '{dataset}' is failed: {reason}")]
    DatasetFailed { dataset: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if the error halts only the dataset that raised it.
    pub fn is_dataset_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Self::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(IndexerError::from(SourceError::Transient("timeout".into())).is_retryable());
        assert!(!IndexerError::from(SourceError::Decode("bad hex".into())).is_retryable());
        assert!(IndexerError::from(StoreError::transient("sqlite", "busy")).is_retryable());
        assert!(!IndexerError::from(StoreError::Constraint("dup".into())).is_retryable());
    }

    #[test]
    fn mapping_errors_are_dataset_fatal() {
        let e = IndexerError::Mapping {
            handler: "handleTransfer".into(),
            reason: "bad input".into(),
        };
        assert!(e.is_dataset_fatal());
        assert!(!IndexerError::Aborted { reason: "shutdown".into() }.is_dataset_fatal());
    }
}
