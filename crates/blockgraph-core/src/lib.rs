//! blockgraph-core: chain cursor, versioned entity model and two-phase
//! block commit for the reorg-safe indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! DatasetPipeline (blockgraph-pipeline)
//!     ├── ChainCursor        (chain segment, reorg detection)
//!     ├── MappingExecutor    (block + events → entity ops)
//!     ├── BlockCommitter     (stage/mark across both stores)
//!     │     ├── EntityStore
//!     │     └── GraphProjector → GraphStore
//!     └── CheckpointManager  (cursor persistence, failure record)
//! ```

pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod cursor;
pub mod entity;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod mapping;
pub mod memory;
pub mod projector;
pub mod reorg;
pub mod retry;
pub mod segment;
pub mod source;
pub mod store;
pub mod types;
pub mod versioned;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use commit::BlockCommitter;
pub use config::{DatasetState, DatasetStatus, DeepReorgPolicy, PipelineConfig};
pub use cursor::{ChainCursor, Cursor};
pub use entity::{Entity, EntityKey, EntityOp, Fields};
pub use error::{IndexerError, SourceError, StoreError};
pub use graph::{Edge, EdgeKey, GraphMutation, Node};
pub use manifest::{FileManifestResolver, Manifest, ManifestResolver, StaticManifestResolver};
pub use mapping::{HandlerMapping, MappingContext, MappingExecutor, MatchedEvent};
pub use projector::GraphProjector;
pub use reorg::{Outcome, ReorgEvent};
pub use retry::{RetryConfig, RetryPolicy};
pub use segment::ChainSegment;
pub use source::{BlockSource, InMemoryChain};
pub use store::{BlockStore, EntityStore, GraphStore, StageOutcome};
pub use types::{Block, BlockId, BlockNumber, BlockPtr, ChainEvent};
