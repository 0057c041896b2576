//! The chain endpoint abstraction and an in-memory chain for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::SourceError;
use crate::types::{Block, BlockId, BlockNumber, BlockPtr, ChainEvent};

/// Read-only access to a chain endpoint.
///
/// Implementations are shared across dataset pipelines, so they must be
/// `Send + Sync`. A block that is not (or no longer) known returns `Ok(None)`.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// The endpoint's current canonical head.
    async fn get_head(&self) -> Result<Block, SourceError>;

    /// A block by number (canonical chain) or by hash.
    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, SourceError>;

    /// The ancestor `depth` generations above the block with `hash`
    /// (`depth == 0` returns the block itself).
    async fn get_ancestor(&self, hash: &str, depth: u64) -> Result<Option<Block>, SourceError> {
        let mut current = match self.get_block(&BlockId::Hash(hash.to_string())).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        for _ in 0..depth {
            current = match self
                .get_block(&BlockId::Hash(current.parent_hash.clone()))
                .await?
            {
                Some(b) => b,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// All logs emitted in the given block, in log-index order.
    async fn get_events(&self, block: &BlockPtr) -> Result<Vec<ChainEvent>, SourceError>;
}

// ─── InMemoryChain ────────────────────────────────────────────────────────────

/// Deterministic hash for block `number` on branch `tag`.
pub fn branch_hash(number: BlockNumber, tag: &str) -> String {
    format!("0x{number:08x}{tag}")
}

#[derive(Default)]
struct ChainInner {
    by_hash: HashMap<String, Block>,
    /// Canonical hashes indexed by block number.
    canonical: Vec<String>,
    events: HashMap<String, Vec<ChainEvent>>,
}

/// A scriptable chain held in memory.
///
/// Starts with a genesis block at height 0. Blocks orphaned by [`reorg`]
/// remain addressable by hash, like uncles on a real node.
///
/// [`reorg`]: InMemoryChain::reorg
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,
    fail_next: AtomicU32,
}

impl InMemoryChain {
    pub fn new() -> Self {
        let genesis = Block::new(0, branch_hash(0, ""), "0x", 0);
        let mut inner = ChainInner::default();
        inner.canonical.push(genesis.hash.clone());
        inner.by_hash.insert(genesis.hash.clone(), genesis);
        Self {
            inner: RwLock::new(inner),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Append `count` blocks on top of the current head, hashed with `tag`.
    pub fn extend(&self, count: u64, tag: &str) -> Vec<Block> {
        let mut inner = self.inner.write();
        let mut added = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(parent) = inner.canonical.last().and_then(|h| inner.by_hash.get(h)).cloned() else {
                break;
            };
            let number = parent.number + 1;
            let block = Block::new(number, branch_hash(number, tag), parent.hash, number as i64 * 12);
            inner.canonical.push(block.hash.clone());
            inner.by_hash.insert(block.hash.clone(), block.clone());
            added.push(block);
        }
        added
    }

    /// Replace everything above `fork_point` with `count` new blocks on branch `tag`.
    pub fn reorg(&self, fork_point: BlockNumber, count: u64, tag: &str) -> Vec<Block> {
        self.inner.write().canonical.truncate(fork_point as usize + 1);
        self.extend(count, tag)
    }

    /// The canonical block at `number`.
    pub fn block_at(&self, number: BlockNumber) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .canonical
            .get(number as usize)
            .map(|h| inner.by_hash[h].clone())
    }

    /// Attach a log to the block with `block_hash`.
    pub fn add_event(&self, block_hash: &str, mut event: ChainEvent) {
        let mut inner = self.inner.write();
        let number = inner.by_hash.get(block_hash).map(|b| b.number).unwrap_or_default();
        let events = inner.events.entry(block_hash.to_string()).or_default();
        event.block_number = number;
        event.log_index = events.len() as u32;
        events.push(event);
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), SourceError> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(SourceError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockSource for InMemoryChain {
    async fn get_head(&self) -> Result<Block, SourceError> {
        self.maybe_fail()?;
        let inner = self.inner.read();
        let hash = inner
            .canonical
            .last()
            .ok_or_else(|| SourceError::Decode("empty chain".into()))?;
        Ok(inner.by_hash[hash].clone())
    }

    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, SourceError> {
        self.maybe_fail()?;
        let inner = self.inner.read();
        Ok(match id {
            BlockId::Number(n) => inner
                .canonical
                .get(*n as usize)
                .map(|h| inner.by_hash[h].clone()),
            BlockId::Hash(h) => inner.by_hash.get(h).cloned(),
        })
    }

    async fn get_events(&self, block: &BlockPtr) -> Result<Vec<ChainEvent>, SourceError> {
        self.maybe_fail()?;
        Ok(self
            .inner
            .read()
            .events
            .get(&block.hash)
            .cloned()
            .unwrap_or_default())
    }
}
