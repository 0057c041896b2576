//! Reorg detection outcomes and the common-ancestor search.
//!
//! The search is a two-pointer walk over two hash-linked sequences: the local
//! [`ChainSegment`] (newest to oldest) and the endpoint's canonical ancestry
//! starting from a block on the new branch. Both pointers move backwards until
//! they meet on the same hash at the same height.

use crate::error::SourceError;
use crate::segment::ChainSegment;
use crate::source::BlockSource;
use crate::types::{Block, BlockId, BlockNumber, BlockPtr};

/// What the cursor found when asked for the next block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The endpoint has nothing new past the last processed block.
    UpToDate,
    /// The next block extends the last processed block.
    NextBlock(Block),
    /// The endpoint switched branches; state above `revert_to` must be undone.
    Reorg(ReorgEvent),
    /// No common ancestor inside the retained window.
    DeepReorg {
        last_processed: BlockPtr,
        oldest_retained: BlockNumber,
    },
}

/// A reorg whose common ancestor was found inside the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// The common ancestor; stores are reverted to this block.
    pub revert_to: BlockPtr,
    /// First block number to process on the new branch.
    pub replay_from: BlockNumber,
    /// The abandoned blocks, most recent first.
    pub dropped: Vec<Block>,
    /// Number of abandoned blocks.
    pub depth: u64,
}

/// Result of [`find_common_ancestor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AncestorSearch {
    Found { ancestor: Block, dropped: Vec<Block> },
    NotInWindow,
}

/// Walk `segment` and the canonical ancestry of `branch_block` backwards until
/// both sides agree on a hash at the same height.
///
/// A lookup that fails part-way means the endpoint changed branches again
/// while we were searching; that is reported as a transient error so the
/// caller re-runs detection from a fresh head.
pub async fn find_common_ancestor<S: BlockSource + ?Sized>(
    source: &S,
    segment: &ChainSegment,
    branch_block: Block,
) -> Result<AncestorSearch, SourceError> {
    let Some(tip) = segment.tip() else {
        return Ok(AncestorSearch::NotInWindow);
    };

    let mut remote = branch_block;
    if remote.number > tip.number {
        remote = source
            .get_ancestor(&remote.hash, remote.number - tip.number)
            .await?
            .ok_or_else(branch_moved)?;
    }

    let mut dropped = Vec::new();
    for local in segment.iter_rev() {
        if local.number > remote.number {
            dropped.push(local.clone());
            continue;
        }
        if local.hash == remote.hash {
            return Ok(AncestorSearch::Found {
                ancestor: local.clone(),
                dropped,
            });
        }
        dropped.push(local.clone());
        if remote.number == 0 {
            break;
        }
        remote = source
            .get_block(&BlockId::Hash(remote.parent_hash.clone()))
            .await?
            .ok_or_else(branch_moved)?;
    }

    Ok(AncestorSearch::NotInWindow)
}

fn branch_moved() -> SourceError {
    SourceError::Transient("canonical branch changed during ancestor search".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryChain;

    fn segment_of(chain: &InMemoryChain, from: u64, to: u64, window: usize) -> ChainSegment {
        ChainSegment::from_blocks(window, (from..=to).map(|n| chain.block_at(n).unwrap()))
    }

    #[tokio::test]
    async fn finds_ancestor_of_short_reorg() {
        let chain = InMemoryChain::new();
        chain.extend(10, "a");
        let seg = segment_of(&chain, 1, 10, 16);

        let new = chain.reorg(7, 4, "b");
        let candidate = new.iter().find(|b| b.number == 11).unwrap().clone();

        let found = find_common_ancestor(&chain, &seg, candidate).await.unwrap();
        let AncestorSearch::Found { ancestor, dropped } = found else {
            panic!("expected ancestor");
        };
        assert_eq!(ancestor.number, 7);
        assert_eq!(
            dropped.iter().map(|b| b.number).collect::<Vec<_>>(),
            vec![10, 9, 8]
        );
    }

    #[tokio::test]
    async fn branch_shorter_than_segment() {
        let chain = InMemoryChain::new();
        chain.extend(10, "a");
        let seg = segment_of(&chain, 1, 10, 16);

        chain.reorg(5, 2, "b");
        let head = chain.block_at(7).unwrap();
        let found = find_common_ancestor(&chain, &seg, head).await.unwrap();
        let AncestorSearch::Found { ancestor, dropped } = found else {
            panic!("expected ancestor");
        };
        assert_eq!(ancestor.number, 5);
        assert_eq!(dropped.len(), 5);
    }

    #[tokio::test]
    async fn reorg_deeper_than_window() {
        let chain = InMemoryChain::new();
        chain.extend(20, "a");
        let seg = segment_of(&chain, 15, 20, 6);

        let new = chain.reorg(10, 11, "b");
        let candidate = new.last().unwrap().clone();
        let found = find_common_ancestor(&chain, &seg, candidate).await.unwrap();
        assert_eq!(found, AncestorSearch::NotInWindow);
    }
}
