//! Fluent builder API for dataset pipelines.
//!
//! # Example
//!
//! ```rust,no_run
//! use blockgraph_pipeline::PipelineBuilder;
//! use blockgraph_core::config::DeepReorgPolicy;
//!
//! let config = PipelineBuilder::new()
//!     .id("uniswap-v2")
//!     .chain("ethereum")
//!     .manifest("QmUniswapV2")
//!     .start_block(10_000_835)
//!     .window_size(128)
//!     .deep_reorg_policy(DeepReorgPolicy::Rebootstrap { finality_depth: 64 })
//!     .build_config();
//! ```

use blockgraph_core::config::{DeepReorgPolicy, PipelineConfig};
use blockgraph_core::error::IndexerError;
use blockgraph_core::retry::RetryConfig;

use crate::pipeline::{DatasetPipeline, PipelineParts};

/// Fluent builder for [`PipelineConfig`] and [`DatasetPipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Set the dataset ID (keys store partitions and the checkpoint).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain to index.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the manifest content address.
    pub fn manifest(mut self, address: impl Into<String>) -> Self {
        self.config.manifest = address.into();
        self
    }

    /// Set the start block, overriding the manifest's.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn stop_block(mut self, block: u64) -> Self {
        self.config.stop_block = Some(block);
        self
    }

    /// Set how many recent blocks are kept for reorg detection.
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.window_size = size;
        self
    }

    /// Set checkpoint save interval (every N blocks).
    pub fn checkpoint_interval(mut self, n: u64) -> Self {
        self.config.checkpoint_interval = n;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn deep_reorg_policy(mut self, policy: DeepReorgPolicy) -> Self {
        self.config.deep_reorg_policy = policy;
        self
    }

    /// Build the `PipelineConfig`.
    pub fn build_config(self) -> PipelineConfig {
        self.config
    }

    /// Validate the configuration and assemble a pipeline over `parts`.
    pub fn build(self, parts: PipelineParts) -> Result<DatasetPipeline, IndexerError> {
        DatasetPipeline::new(self.config, parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = PipelineBuilder::new().build_config();
        assert_eq!(cfg.chain, "ethereum");
        assert_eq!(cfg.window_size, 64);
        assert_eq!(cfg.checkpoint_interval, 1);
        assert_eq!(cfg.deep_reorg_policy, DeepReorgPolicy::Halt);
    }

    #[test]
    fn builder_custom() {
        let cfg = PipelineBuilder::new()
            .id("uniswap-v2")
            .chain("polygon")
            .manifest("QmUniswapV2")
            .start_block(50_000_000)
            .stop_block(50_001_000)
            .window_size(256)
            .deep_reorg_policy(DeepReorgPolicy::Rebootstrap { finality_depth: 64 })
            .build_config();

        assert_eq!(cfg.id, "uniswap-v2");
        assert_eq!(cfg.chain, "polygon");
        assert_eq!(cfg.manifest, "QmUniswapV2");
        assert_eq!(cfg.start_block, Some(50_000_000));
        assert_eq!(cfg.stop_block, Some(50_001_000));
        assert_eq!(cfg.window_size, 256);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_window_rejected() {
        assert!(PipelineBuilder::new().window_size(0).build_config().validate().is_err());
    }
}
