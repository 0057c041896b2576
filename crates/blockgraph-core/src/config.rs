//! Pipeline configuration and dataset state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::{BlockNumber, BlockPtr};

/// What to do when a reorg goes deeper than the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeepReorgPolicy {
    /// Record a failure and stop the dataset.
    #[default]
    Halt,
    /// Revert `max(finality_depth, window_size)` blocks and resync from there.
    Rebootstrap { finality_depth: u64 },
}

/// Configuration for one dataset pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset id; keys store partitions and the checkpoint.
    pub id: String,
    /// Chain to index (e.g. `"ethereum"`).
    pub chain: String,
    /// Manifest content address handed to the resolver.
    pub manifest: String,
    /// First block to index. `None` = the manifest's lowest start block.
    pub start_block: Option<BlockNumber>,
    /// Optional end block (for bounded backfill). `None` = run forever.
    pub stop_block: Option<BlockNumber>,
    /// Number of recent blocks kept for reorg detection.
    pub window_size: usize,
    /// Save a checkpoint every N committed blocks. The default of 1 saves
    /// after every commit; larger values write less often and replay up to
    /// N - 1 blocks after a crash.
    pub checkpoint_interval: u64,
    /// Head polling interval once caught up (milliseconds).
    pub poll_interval_ms: u64,
    pub retry: RetryConfig,
    pub deep_reorg_policy: DeepReorgPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            manifest: String::new(),
            start_block: None,
            stop_block: None,
            window_size: 64,
            checkpoint_interval: 1,
            poll_interval_ms: 2000,
            retry: RetryConfig::default(),
            deep_reorg_policy: DeepReorgPolicy::Halt,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_json::from_str(json).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.id.is_empty() {
            return Err(IndexerError::Config("dataset id must not be empty".into()));
        }
        if self.window_size == 0 {
            return Err(IndexerError::Config("window_size must be at least 1".into()));
        }
        if let (Some(start), Some(stop)) = (self.start_block, self.stop_block) {
            if stop < start {
                return Err(IndexerError::Config(format!(
                    "stop_block {stop} is below start_block {start}"
                )));
            }
        }
        Ok(())
    }
}

/// Runtime state of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    /// Recovering stores and aligning with the checkpoint.
    Starting,
    /// Behind the endpoint head.
    Syncing,
    /// Caught up, polling for new blocks.
    Live,
    /// Reverting after a reorg.
    ReorgRecovery,
    /// Stopped cleanly (shutdown or stop block).
    Stopped,
    /// Halted on a fatal error.
    Failed,
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Syncing => write!(f, "syncing"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Externally visible status of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub state: DatasetState,
    pub head: Option<BlockPtr>,
    pub fatal_error: Option<String>,
}

impl DatasetStatus {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            state: DatasetState::Starting,
            head: None,
            fatal_error: None,
        }
    }
}
