//! Chain cursor: decides which block is next and detects branch switches.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::reorg::{find_common_ancestor, AncestorSearch, Outcome, ReorgEvent};
use crate::segment::{BrokenLink, ChainSegment};
use crate::source::BlockSource;
use crate::types::{Block, BlockId, BlockNumber, BlockPtr};

/// The persisted position of a dataset in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last block whose effects are committed to both stores.
    pub last_processed_block: Block,
    /// Recently accepted blocks, oldest first, ending at `last_processed_block`.
    pub segment: Vec<Block>,
}

impl Cursor {
    pub fn ptr(&self) -> BlockPtr {
        self.last_processed_block.ptr()
    }
}

/// Owns the locally recorded canonical segment for one dataset.
///
/// Detection ([`advance`](Self::advance)) never mutates the cursor; the
/// pipeline calls [`accept`](Self::accept) once a block is committed and
/// [`rewind_to`](Self::rewind_to) once the stores are reverted.
pub struct ChainCursor {
    source: Arc<dyn BlockSource>,
    start_block: BlockNumber,
    last: Option<Block>,
    segment: ChainSegment,
}

impl ChainCursor {
    /// A cursor that has processed nothing and will start at `start_block`.
    pub fn new(source: Arc<dyn BlockSource>, start_block: BlockNumber, window_size: usize) -> Self {
        Self {
            source,
            start_block,
            last: None,
            segment: ChainSegment::new(window_size),
        }
    }

    /// Resume from a persisted cursor.
    pub fn resume(
        source: Arc<dyn BlockSource>,
        start_block: BlockNumber,
        window_size: usize,
        cursor: Cursor,
    ) -> Self {
        let mut segment = ChainSegment::from_blocks(window_size, cursor.segment);
        if segment.tip() != Some(&cursor.last_processed_block) {
            segment.reset(cursor.last_processed_block.clone());
        }
        Self {
            source,
            start_block,
            last: Some(cursor.last_processed_block),
            segment,
        }
    }

    pub fn last_processed(&self) -> Option<&Block> {
        self.last.as_ref()
    }

    pub fn segment(&self) -> &ChainSegment {
        &self.segment
    }

    /// The block number the cursor will ask for next.
    pub fn next_number(&self) -> BlockNumber {
        self.last.as_ref().map_or(self.start_block, |b| b.number + 1)
    }

    /// The persistable form of this cursor, once at least one block is accepted.
    pub fn snapshot(&self) -> Option<Cursor> {
        self.last.as_ref().map(|last| Cursor {
            last_processed_block: last.clone(),
            segment: self.segment.to_vec(),
        })
    }

    /// Ask the endpoint for the block after the last processed one.
    pub async fn advance(&self) -> Result<Outcome, SourceError> {
        let head = self.source.get_head().await?;

        let Some(last) = self.last.as_ref() else {
            if head.number < self.start_block {
                return Ok(Outcome::UpToDate);
            }
            return Ok(
                match self.source.get_block(&BlockId::Number(self.start_block)).await? {
                    Some(first) => Outcome::NextBlock(first),
                    None => Outcome::UpToDate,
                },
            );
        };

        if head.hash == last.hash {
            return Ok(Outcome::UpToDate);
        }

        if head.number <= last.number {
            let canonical = if head.number == last.number {
                Some(head.clone())
            } else {
                self.source.get_block(&BlockId::Number(last.number)).await?
            };
            return match canonical {
                Some(b) if b.hash == last.hash => Ok(Outcome::UpToDate),
                Some(b) => self.reorg_from(last, b).await,
                None => self.reorg_from(last, head).await,
            };
        }

        match self.source.get_block(&BlockId::Number(last.number + 1)).await? {
            Some(candidate) if candidate.parent_hash == last.hash => {
                debug!(number = candidate.number, hash = %candidate.hash, "Next block");
                Ok(Outcome::NextBlock(candidate))
            }
            Some(candidate) => self.reorg_from(last, candidate).await,
            None => {
                // Head is past us but the next block vanished: check whether
                // our own tip is still canonical before calling it a reorg.
                match self.source.get_block(&BlockId::Number(last.number)).await? {
                    Some(b) if b.hash == last.hash => Ok(Outcome::UpToDate),
                    Some(b) => self.reorg_from(last, b).await,
                    None => self.reorg_from(last, head).await,
                }
            }
        }
    }

    /// Check that the resumed position is still on the canonical chain.
    pub async fn verify_canonical(&self) -> Result<Outcome, SourceError> {
        let Some(last) = self.last.as_ref() else {
            return Ok(Outcome::UpToDate);
        };
        match self.source.get_block(&BlockId::Number(last.number)).await? {
            Some(b) if b.hash == last.hash => Ok(Outcome::UpToDate),
            Some(b) => {
                warn!(
                    number = last.number,
                    checkpoint = %last.hash,
                    canonical = %b.hash,
                    "Checkpoint block is no longer canonical"
                );
                self.reorg_from(last, b).await
            }
            None => {
                let head = self.source.get_head().await?;
                if head.number < last.number {
                    warn!(number = last.number, head = head.number, "Endpoint head is below checkpoint");
                    self.reorg_from(last, head).await
                } else {
                    Err(SourceError::Transient(format!(
                        "block {} missing below head {}",
                        last.number, head.number
                    )))
                }
            }
        }
    }

    async fn reorg_from(&self, last: &Block, branch_block: Block) -> Result<Outcome, SourceError> {
        match find_common_ancestor(self.source.as_ref(), &self.segment, branch_block).await? {
            AncestorSearch::Found { ancestor, .. } if ancestor.hash == last.hash => {
                Ok(Outcome::UpToDate)
            }
            AncestorSearch::Found { ancestor, dropped } => {
                let depth = dropped.len() as u64;
                warn!(
                    depth,
                    ancestor = ancestor.number,
                    ancestor_hash = %ancestor.hash,
                    last = last.number,
                    "Reorg detected"
                );
                Ok(Outcome::Reorg(ReorgEvent {
                    revert_to: ancestor.ptr(),
                    replay_from: ancestor.number + 1,
                    dropped,
                    depth,
                }))
            }
            AncestorSearch::NotInWindow => {
                let oldest_retained = self.segment.oldest().map_or(last.number, |b| b.number);
                warn!(
                    last = last.number,
                    oldest_retained,
                    window = self.segment.window_size(),
                    "Reorg deeper than retained window"
                );
                Ok(Outcome::DeepReorg {
                    last_processed: last.ptr(),
                    oldest_retained,
                })
            }
        }
    }

    /// Record a block whose effects are now committed.
    pub fn accept(&mut self, block: Block) -> Result<(), BrokenLink> {
        if self.segment.is_empty() {
            self.segment.reset(block.clone());
        } else {
            self.segment.push(block.clone())?;
        }
        self.last = Some(block);
        Ok(())
    }

    /// Drop everything above the common ancestor after the stores were reverted.
    pub fn rewind_to(&mut self, ancestor: &BlockPtr) -> Vec<Block> {
        let dropped = self.segment.rewind_to(ancestor.number);
        self.last = self.segment.tip().cloned();
        dropped
    }

    /// Restart the cursor at `block`, discarding the window. Used when
    /// re-bootstrapping after a reorg deeper than the window.
    pub fn reset_to(&mut self, block: Block) {
        self.segment.reset(block.clone());
        self.last = Some(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryChain;

    fn cursor_over(chain: &Arc<InMemoryChain>, start: u64, window: usize) -> ChainCursor {
        ChainCursor::new(chain.clone(), start, window)
    }

    async fn drive(cursor: &mut ChainCursor, until: u64) {
        while cursor.last_processed().map_or(true, |b| b.number < until) {
            match cursor.advance().await.unwrap() {
                Outcome::NextBlock(b) => cursor.accept(b).unwrap(),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn linear_advance_then_up_to_date() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(5, "a");
        let mut cursor = cursor_over(&chain, 1, 8);

        drive(&mut cursor, 5).await;
        assert_eq!(cursor.advance().await.unwrap(), Outcome::UpToDate);
        assert_eq!(cursor.next_number(), 6);
        assert_eq!(cursor.segment().len(), 5);
    }

    #[tokio::test]
    async fn waits_for_start_block() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(2, "a");
        let cursor = cursor_over(&chain, 10, 8);
        assert_eq!(cursor.advance().await.unwrap(), Outcome::UpToDate);
    }

    #[tokio::test]
    async fn detects_reorg_and_rewinds() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(10, "a");
        let mut cursor = cursor_over(&chain, 1, 16);
        drive(&mut cursor, 10).await;

        chain.reorg(7, 4, "b");
        let Outcome::Reorg(event) = cursor.advance().await.unwrap() else {
            panic!("expected reorg");
        };
        assert_eq!(event.revert_to.number, 7);
        assert_eq!(event.replay_from, 8);
        assert_eq!(event.depth, 3);

        cursor.rewind_to(&event.revert_to);
        assert_eq!(cursor.last_processed().unwrap().number, 7);
        let Outcome::NextBlock(b) = cursor.advance().await.unwrap() else {
            panic!("expected next block");
        };
        assert_eq!(b.hash, crate::source::branch_hash(8, "b"));
    }

    #[tokio::test]
    async fn same_height_competing_head_is_reorg() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(6, "a");
        let mut cursor = cursor_over(&chain, 1, 16);
        drive(&mut cursor, 6).await;

        chain.reorg(5, 1, "b");
        let Outcome::Reorg(event) = cursor.advance().await.unwrap() else {
            panic!("expected reorg");
        };
        assert_eq!(event.revert_to.number, 5);
        assert_eq!(event.depth, 1);
    }

    #[tokio::test]
    async fn reorg_onto_identical_branch_is_noop() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(4, "a");
        let mut cursor = cursor_over(&chain, 1, 16);
        drive(&mut cursor, 4).await;

        chain.reorg(3, 1, "a");
        assert_eq!(cursor.advance().await.unwrap(), Outcome::UpToDate);
    }

    #[tokio::test]
    async fn deep_reorg_outside_window() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(20, "a");
        let mut cursor = cursor_over(&chain, 1, 4);
        drive(&mut cursor, 20).await;

        chain.reorg(10, 12, "b");
        match cursor.advance().await.unwrap() {
            Outcome::DeepReorg {
                last_processed,
                oldest_retained,
            } => {
                assert_eq!(last_processed.number, 20);
                assert_eq!(oldest_retained, 17);
            }
            other => panic!("expected deep reorg, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_canonical_after_offline_reorg() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(8, "a");
        let mut first = cursor_over(&chain, 1, 16);
        drive(&mut first, 8).await;
        let saved = first.snapshot().unwrap();

        chain.reorg(6, 5, "b");
        let resumed = ChainCursor::resume(chain.clone(), 1, 16, saved);
        let Outcome::Reorg(event) = resumed.verify_canonical().await.unwrap() else {
            panic!("expected reorg");
        };
        assert_eq!(event.revert_to.number, 6);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_resumes_position() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(3, "a");
        let mut cursor = cursor_over(&chain, 1, 16);
        drive(&mut cursor, 3).await;

        let resumed = ChainCursor::resume(chain.clone(), 1, 16, cursor.snapshot().unwrap());
        assert_eq!(resumed.next_number(), 4);
        assert_eq!(resumed.verify_canonical().await.unwrap(), Outcome::UpToDate);
    }
}
