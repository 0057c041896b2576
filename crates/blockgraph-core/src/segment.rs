//! Chain segment: a bounded window of recently accepted blocks used to find
//! the common ancestor when the endpoint switches branches.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Block, BlockNumber};

/// Error returned by [`ChainSegment::push`] when a block does not link to the tip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("block {offered} does not extend segment tip {tip}")]
pub struct BrokenLink {
    pub tip: BlockNumber,
    pub offered: BlockNumber,
}

/// The last N accepted blocks, oldest first.
///
/// Every block's `parent_hash` equals the previous block's `hash`; the oldest
/// block's parent is assumed final and is not retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSegment {
    blocks: VecDeque<Block>,
    window_size: usize,
}

impl ChainSegment {
    /// Create an empty segment retaining at most `window_size` blocks.
    pub fn new(window_size: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Rebuild a segment from persisted blocks, keeping only the linked suffix.
    pub fn from_blocks(window_size: usize, blocks: impl IntoIterator<Item = Block>) -> Self {
        let mut segment = Self::new(window_size);
        for block in blocks {
            if segment.push(block.clone()).is_err() {
                segment.blocks.clear();
                segment.blocks.push_back(block);
            }
        }
        segment
    }

    /// Append a block that extends the tip, evicting the oldest block when full.
    pub fn push(&mut self, block: Block) -> Result<(), BrokenLink> {
        if let Some(tip) = self.blocks.back() {
            if !block.extends(tip) {
                return Err(BrokenLink {
                    tip: tip.number,
                    offered: block.number,
                });
            }
        }
        if self.blocks.len() >= self.window_size {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
        Ok(())
    }

    /// The most recently accepted block.
    pub fn tip(&self) -> Option<&Block> {
        self.blocks.back()
    }

    /// The oldest retained block.
    pub fn oldest(&self) -> Option<&Block> {
        self.blocks.front()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: BlockNumber) -> Option<&Block> {
        let oldest = self.blocks.front()?.number;
        let idx = number.checked_sub(oldest)? as usize;
        self.blocks.get(idx)
    }

    /// Blocks from newest to oldest.
    pub fn iter_rev(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Discard every block above `number`. Returns the discarded blocks,
    /// newest first.
    pub fn rewind_to(&mut self, number: BlockNumber) -> Vec<Block> {
        let mut dropped = Vec::new();
        while let Some(back) = self.blocks.back() {
            if back.number > number {
                dropped.extend(self.blocks.pop_back());
            } else {
                break;
            }
        }
        dropped
    }

    /// Drop all blocks and restart the window at `block`.
    pub fn reset(&mut self, block: Block) {
        self.blocks.clear();
        self.blocks.push_back(block);
    }

    /// Owned copy of the retained blocks, oldest first.
    pub fn to_vec(&self) -> Vec<Block> {
        self.blocks.iter().cloned().collect()
    }
}
