//! Shared chain types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

/// Block height.
pub type BlockNumber = u64;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block header as fetched from the endpoint. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number.
    pub number: BlockNumber,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl Block {
    pub fn new(
        number: BlockNumber,
        hash: impl Into<String>,
        parent_hash: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            number,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
            timestamp,
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// The `(number, hash)` pointer for this block.
    pub fn ptr(&self) -> BlockPtr {
        BlockPtr::new(self.number, self.hash.clone())
    }
}

// ─── BlockPtr ─────────────────────────────────────────────────────────────────

/// A `(number, hash)` pair identifying one block on one branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtr {
    pub number: BlockNumber,
    pub hash: String,
}

impl BlockPtr {
    pub fn new(number: BlockNumber, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
        }
    }
}

impl std::fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// How to address a block on the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(BlockNumber),
    Hash(String),
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "#{n}"),
            Self::Hash(h) => write!(f, "{h}"),
        }
    }
}

// ─── ChainEvent ───────────────────────────────────────────────────────────────

/// A raw log emitted in a block, before mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Contract address that emitted the event.
    pub address: String,
    /// Indexed topics; `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// Unindexed payload (`0x…`).
    pub data: String,
    /// Transaction hash.
    pub tx_hash: String,
    /// Block number.
    pub block_number: BlockNumber,
    /// Log index within the block.
    pub log_index: u32,
}

impl ChainEvent {
    /// The event signature (first topic), if any.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
