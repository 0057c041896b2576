//! Runs several dataset pipelines side by side.
//!
//! Each pipeline is its own tokio task with exclusive store partitions; a
//! failure in one is recorded in its status and never touches the others.

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use blockgraph_core::config::{DatasetState, DatasetStatus};
use blockgraph_core::error::IndexerError;

use crate::pipeline::{DatasetPipeline, StatusMap};

/// Owns the running pipelines and their shared status map.
pub struct Supervisor {
    status: StatusMap,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<Result<(), IndexerError>>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            status: StatusMap::default(),
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Start `pipeline` on its own task.
    pub fn spawn(&mut self, pipeline: DatasetPipeline) -> Result<(), IndexerError> {
        let id = pipeline.id().to_string();
        if self.tasks.iter().any(|(running, _)| running == &id) {
            return Err(IndexerError::Config(format!("dataset '{id}' is already running")));
        }
        let pipeline = pipeline.with_status(self.status.clone());
        let handle = tokio::spawn(pipeline.run(self.shutdown.subscribe()));
        info!(dataset = %id, "Pipeline spawned");
        self.tasks.push((id, handle));
        Ok(())
    }

    pub fn status(&self, dataset: &str) -> Option<DatasetStatus> {
        self.status.get(dataset).map(|s| s.clone())
    }

    /// Status of every dataset, ordered by id.
    pub fn statuses(&self) -> Vec<DatasetStatus> {
        let mut all: Vec<_> = self.status.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.dataset.cmp(&b.dataset));
        all
    }

    pub fn status_map(&self) -> StatusMap {
        self.status.clone()
    }

    /// Ask every pipeline to stop at its next block boundary.
    pub fn shutdown(&self) {
        info!(pipelines = self.tasks.len(), "Shutting down pipelines");
        self.shutdown.send_replace(true);
    }

    /// Wait for every pipeline to finish. A panicked task is reported as a
    /// failed dataset.
    pub async fn join(self) -> Vec<(String, Result<(), IndexerError>)> {
        let (ids, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = join_all(handles).await;
        ids.into_iter()
            .zip(results)
            .map(|(id, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    error!(dataset = %id, error = %e, "Pipeline task panicked");
                    if let Some(mut status) = self.status.get_mut(&id) {
                        status.state = DatasetState::Failed;
                        status.fatal_error = Some(e.to_string());
                    }
                    Err(IndexerError::Other(format!("pipeline task failed: {e}")))
                });
                (id, result)
            })
            .collect()
    }

    /// Signal shutdown and wait for every pipeline.
    pub async fn stop(self) -> Vec<(String, Result<(), IndexerError>)> {
        self.shutdown();
        self.join().await
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use blockgraph_core::checkpoint::MemoryCheckpointStore;
    use blockgraph_core::manifest::{Manifest, StaticManifestResolver};
    use blockgraph_core::mapping::HandlerMapping;
    use blockgraph_core::memory::{InMemoryEntityStore, InMemoryGraphStore};
    use blockgraph_core::source::InMemoryChain;

    use crate::builder::PipelineBuilder;
    use crate::pipeline::PipelineParts;

    const MANIFEST: &str = r#"{ "name": "blocks", "data_sources": [{ "name": "Any" }] }"#;

    fn pipeline(chain: &Arc<InMemoryChain>, id: &str) -> DatasetPipeline {
        let resolver = StaticManifestResolver::new().with("QmBlocks", Manifest::from_json(MANIFEST).unwrap());
        PipelineBuilder::new()
            .id(id)
            .manifest("QmBlocks")
            .poll_interval_ms(5)
            .build(PipelineParts {
                source: chain.clone(),
                resolver: Arc::new(resolver),
                mapping: Arc::new(HandlerMapping::new()),
                entities: Arc::new(InMemoryEntityStore::new(id)),
                graph: Arc::new(InMemoryGraphStore::new(id)),
                checkpoints: Box::new(MemoryCheckpointStore::new()),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_dataset() {
        let chain = Arc::new(InMemoryChain::new());
        let mut supervisor = Supervisor::new();
        supervisor.spawn(pipeline(&chain, "a")).unwrap();
        let err = supervisor.spawn(pipeline(&chain, "a")).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn stop_halts_every_pipeline() {
        let chain = Arc::new(InMemoryChain::new());
        chain.extend(3, "a");
        let mut supervisor = Supervisor::new();
        supervisor.spawn(pipeline(&chain, "b")).unwrap();
        supervisor.spawn(pipeline(&chain, "a")).unwrap();

        while supervisor.statuses().iter().any(|s| s.state != DatasetState::Live) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let ids: Vec<_> = supervisor.statuses().into_iter().map(|s| s.dataset).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(supervisor.status("a").unwrap().head.map(|h| h.number), Some(3));

        let results = tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("pipelines did not stop");
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
