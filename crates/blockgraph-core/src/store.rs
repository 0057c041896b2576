//! Store traits shared by the entity and graph backends.
//!
//! Both stores follow the same per-block contract: a block is first staged
//! (durable but invisible), then marked committed, which applies the staged
//! payload, records the block hash and advances the head in one native
//! transaction. The two-phase split lets [`BlockCommitter`] converge both
//! stores after a crash.
//!
//! [`BlockCommitter`]: crate::commit::BlockCommitter

use async_trait::async_trait;

use crate::entity::{Entity, EntityKey, EntityOp};
use crate::error::StoreError;
use crate::graph::{Edge, GraphMutation, Node};
use crate::manifest::Manifest;
use crate::types::{BlockNumber, BlockPtr};

/// Result of staging a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The block is staged and waits for [`BlockStore::mark_committed`].
    Staged,
    /// The block is already committed with the same hash; nothing to do.
    AlreadyCommitted,
}

/// Decide whether `block` may be staged on top of `head`.
///
/// `recorded` is the hash the store recorded at `block.number`, if any.
pub fn check_sequence(
    head: Option<&BlockPtr>,
    recorded: Option<&str>,
    block: &BlockPtr,
) -> Result<StageOutcome, StoreError> {
    let Some(head) = head else {
        return Ok(StageOutcome::Staged);
    };
    if block.number <= head.number {
        return match recorded {
            Some(hash) if hash == block.hash => Ok(StageOutcome::AlreadyCommitted),
            committed => Err(StoreError::Conflict {
                number: block.number,
                committed: committed.unwrap_or("<unknown>").to_string(),
                offered: block.hash.clone(),
            }),
        };
    }
    if block.number != head.number + 1 {
        return Err(StoreError::NonSequential {
            expected: head.number + 1,
            got: block.number,
        });
    }
    Ok(StageOutcome::Staged)
}

/// Commit bookkeeping common to entity and graph stores.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Short name used in logs and errors (`"entities"`, `"graph"`).
    fn name(&self) -> &str;

    /// Last committed block.
    async fn head(&self) -> Result<Option<BlockPtr>, StoreError>;

    /// Block staged but not yet marked, if any.
    async fn staged(&self) -> Result<Option<BlockPtr>, StoreError>;

    /// Apply the staged payload for `block` and advance the head.
    ///
    /// Marking a block that is already the head is a no-op.
    async fn mark_committed(&self, block: &BlockPtr) -> Result<(), StoreError>;

    /// Drop the staged payload without applying it.
    async fn discard_staged(&self) -> Result<(), StoreError>;

    /// Undo every block above `block`. No-op when `block >= head`.
    async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError>;
}

/// Block-versioned entity storage with snapshot reads.
#[async_trait]
pub trait EntityStore: BlockStore {
    /// Validate `ops` against the current state and stage their net effect.
    async fn stage_block(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError>;

    /// Stage and mark in one call.
    async fn commit_block(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError> {
        let outcome = self.stage_block(block, ops).await?;
        if outcome == StageOutcome::Staged {
            self.mark_committed(block).await?;
        }
        Ok(outcome)
    }

    /// The version of `key` visible at block `at`.
    async fn get(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Entity>, StoreError>;

    /// All entities of `entity_type` visible at `at`, ordered by id.
    async fn find(&self, entity_type: &str, at: BlockNumber) -> Result<Vec<Entity>, StoreError>;

    /// Number of entities visible at `at`.
    async fn entity_count(&self, at: BlockNumber) -> Result<u64, StoreError>;
}

/// Block-versioned node/edge storage.
#[async_trait]
pub trait GraphStore: BlockStore {
    /// Register the manifest's node and edge labels.
    async fn ensure_schema(&self, manifest: &Manifest) -> Result<(), StoreError>;

    /// Stage `mutations` for `block`. Unknown labels are rejected.
    async fn stage_block(
        &self,
        block: &BlockPtr,
        mutations: &[GraphMutation],
    ) -> Result<StageOutcome, StoreError>;

    async fn node(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Node>, StoreError>;

    /// Outgoing edges of `key` visible at `at`.
    async fn edges_from(&self, key: &EntityKey, at: BlockNumber) -> Result<Vec<Edge>, StoreError>;

    async fn node_count(&self, at: BlockNumber) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(n: u64, h: &str) -> BlockPtr {
        BlockPtr::new(n, h)
    }

    #[test]
    fn first_block_is_accepted_anywhere() {
        assert_eq!(check_sequence(None, None, &ptr(42, "0x2a")).unwrap(), StageOutcome::Staged);
    }

    #[test]
    fn sequence_rules() {
        let head = ptr(10, "0xa");
        assert_eq!(
            check_sequence(Some(&head), None, &ptr(11, "0xb")).unwrap(),
            StageOutcome::Staged
        );
        assert_eq!(
            check_sequence(Some(&head), Some("0xa"), &ptr(10, "0xa")).unwrap(),
            StageOutcome::AlreadyCommitted
        );
        assert!(matches!(
            check_sequence(Some(&head), Some("0xa"), &ptr(10, "0xz")),
            Err(StoreError::Conflict { number: 10, .. })
        ));
        assert!(matches!(
            check_sequence(Some(&head), None, &ptr(13, "0xc")),
            Err(StoreError::NonSequential { expected: 11, got: 13 })
        ));
    }
}
