//! Two-phase block commit across the entity and graph stores.
//!
//! The stores do not share a transaction. A block is staged in both before
//! either is marked, so a crash leaves at most one staged marker per store;
//! [`BlockCommitter::recover`] converges them on startup.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::entity::EntityOp;
use crate::error::StoreError;
use crate::manifest::Manifest;
use crate::projector::GraphProjector;
use crate::store::{EntityStore, GraphStore, StageOutcome};
use crate::types::{BlockNumber, BlockPtr};

pub struct BlockCommitter {
    entities: Arc<dyn EntityStore>,
    graph: Arc<dyn GraphStore>,
    projector: GraphProjector,
}

impl BlockCommitter {
    pub fn new(entities: Arc<dyn EntityStore>, graph: Arc<dyn GraphStore>, manifest: &Manifest) -> Self {
        let projector = GraphProjector::new(graph.clone(), manifest);
        Self {
            entities,
            graph,
            projector,
        }
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    /// Commit `ops` for `block` to both stores.
    ///
    /// Order: stage entities, project and stage graph, mark entities, mark
    /// graph. Returns `AlreadyCommitted` only if both stores already hold it.
    pub async fn commit(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError> {
        let entities = self.entities.stage_block(block, ops).await?;

        let graph = self.stage_graph(block, ops).await;
        let graph = match graph {
            Ok(outcome) => outcome,
            Err(e) => {
                if entities == StageOutcome::Staged {
                    self.entities.discard_staged().await?;
                }
                return Err(e);
            }
        };

        if entities == StageOutcome::Staged {
            self.entities.mark_committed(block).await?;
        }
        if graph == StageOutcome::Staged {
            self.graph.mark_committed(block).await?;
        }

        if entities == StageOutcome::AlreadyCommitted && graph == StageOutcome::AlreadyCommitted {
            debug!(block = %block, "Block already committed");
            return Ok(StageOutcome::AlreadyCommitted);
        }
        Ok(StageOutcome::Staged)
    }

    /// Project `ops` and stage them in the graph store.
    ///
    /// A block the graph already holds is only checked against the recorded
    /// hash: its effects are part of the graph head, so projecting the ops
    /// again would resolve them against their own result.
    async fn stage_graph(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError> {
        let held = self.graph.head().await?.is_some_and(|head| head.number >= block.number);
        if held {
            return self.graph.stage_block(block, &[]).await;
        }
        let mutations = self.projector.project(block, ops).await?;
        self.graph.stage_block(block, &mutations).await
    }

    /// Revert both stores to `block`.
    pub async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError> {
        self.entities.revert_to(block).await?;
        self.graph.revert_to(block).await?;
        Ok(())
    }

    /// Heads of the entity and graph stores.
    pub async fn heads(&self) -> Result<(Option<BlockPtr>, Option<BlockPtr>), StoreError> {
        Ok((self.entities.head().await?, self.graph.head().await?))
    }

    /// Bring both stores to the same committed head after a crash.
    ///
    /// Staged payloads are replayed as written, so calling this repeatedly is
    /// safe. Returns the common head.
    pub async fn recover(&self) -> Result<Option<BlockPtr>, StoreError> {
        let entities_staged = self.entities.staged().await?;
        let graph_staged = self.graph.staged().await?;
        let (entities_head, graph_head) = self.heads().await?;

        match (entities_staged, graph_staged) {
            (Some(e), Some(g)) if e == g => {
                info!(block = %e, "Completing block staged in both stores");
                self.entities.mark_committed(&e).await?;
                self.graph.mark_committed(&g).await?;
            }
            (Some(e), None) if graph_head.as_ref() == Some(&e) => {
                info!(block = %e, "Graph committed ahead of entities, completing entities");
                self.entities.mark_committed(&e).await?;
            }
            (None, Some(g)) if entities_head.as_ref() == Some(&g) => {
                info!(block = %g, "Entities committed ahead of graph, completing graph");
                self.graph.mark_committed(&g).await?;
            }
            (e, g) => {
                if let Some(e) = e {
                    warn!(block = %e, "Discarding block staged only in entity store");
                    self.entities.discard_staged().await?;
                }
                if let Some(g) = g {
                    warn!(block = %g, "Discarding block staged only in graph store");
                    self.graph.discard_staged().await?;
                }
            }
        }

        let (entities_head, graph_head) = self.heads().await?;
        match (&entities_head, &graph_head) {
            (e, g) if e == g => Ok(entities_head),
            (Some(e), Some(g)) if e.number != g.number => {
                let low = if e.number > g.number {
                    warn!(store = self.entities.name(), to = %g, "Reverting store that is ahead");
                    self.entities.revert_to(g.number).await?;
                    g
                } else {
                    warn!(store = self.graph.name(), to = %e, "Reverting store that is ahead");
                    self.graph.revert_to(e.number).await?;
                    e
                };
                let (e_now, g_now) = self.heads().await?;
                if e_now != g_now {
                    return Err(StoreError::Diverged {
                        entities: e_now.map(|p| p.number),
                        graph: g_now.map(|p| p.number),
                    });
                }
                Ok(Some(low.clone()))
            }
            _ => Err(StoreError::Diverged {
                entities: entities_head.as_ref().map(|p| p.number),
                graph: graph_head.as_ref().map(|p| p.number),
            }),
        }
    }
}
