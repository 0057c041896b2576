//! blockgraph-pipeline: JSON-RPC block source, per-dataset ingestion loop
//! and the supervisor that runs many datasets at once.

pub mod builder;
pub mod pipeline;
pub mod rpc;
pub mod supervisor;

pub use builder::PipelineBuilder;
pub use pipeline::{DatasetPipeline, PipelineParts, StatusMap};
pub use rpc::{EvmRpcClient, RawLog, RpcBlockSource};
pub use supervisor::Supervisor;
