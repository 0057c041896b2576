//! In-memory entity and graph stores.
//!
//! All data is lost when the process exits. Used by tests and by embedded
//! pipelines that rebuild from the chain on start.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::entity::{check_ops, collapse_ops, Entity, EntityKey, EntityOp, EntityWrite, Fields};
use crate::error::StoreError;
use crate::graph::{Edge, EdgeKey, GraphMutation, GraphSchema, Node};
use crate::manifest::Manifest;
use crate::store::{check_sequence, BlockStore, EntityStore, GraphStore, StageOutcome};
use crate::types::{BlockNumber, BlockPtr};
use crate::versioned::{plan_drop, plan_put, VersionedTable};

/// Block hashes, head and staged payload of one store partition.
struct Ledger<P> {
    hashes: BTreeMap<BlockNumber, String>,
    head: Option<BlockPtr>,
    staged: Option<(BlockPtr, P)>,
}

impl<P> Default for Ledger<P> {
    fn default() -> Self {
        Self {
            hashes: BTreeMap::new(),
            head: None,
            staged: None,
        }
    }
}

impl<P> Ledger<P> {
    fn check(&self, block: &BlockPtr) -> Result<StageOutcome, StoreError> {
        check_sequence(
            self.head.as_ref(),
            self.hashes.get(&block.number).map(String::as_str),
            block,
        )
    }

    /// Take the payload staged for `block`; `None` if `block` is already the head.
    fn take_staged(&mut self, store: &str, block: &BlockPtr) -> Result<Option<P>, StoreError> {
        if self.head.as_ref() == Some(block) {
            return Ok(None);
        }
        match self.staged.take() {
            Some((ptr, payload)) if &ptr == block => Ok(Some(payload)),
            other => {
                self.staged = other;
                Err(StoreError::InvalidOp(format!(
                    "{store}: block {block} is not staged"
                )))
            }
        }
    }

    fn advance(&mut self, block: &BlockPtr) {
        self.hashes.insert(block.number, block.hash.clone());
        self.head = Some(block.clone());
    }

    /// Returns `false` when there is nothing above `block` to undo.
    fn revert_to(&mut self, block: BlockNumber) -> bool {
        if self.head.as_ref().map_or(true, |h| block >= h.number) {
            return false;
        }
        self.hashes.split_off(&(block + 1));
        self.head = self
            .hashes
            .iter()
            .next_back()
            .map(|(n, h)| BlockPtr::new(*n, h.clone()));
        self.staged = None;
        true
    }
}

fn injected(store: &str, flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.swap(false, Ordering::SeqCst) {
        return Err(StoreError::transient(store, "injected mark failure"));
    }
    Ok(())
}

// ─── Entities ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EntityState {
    table: VersionedTable<EntityKey, Fields>,
    ledger: Ledger<Vec<EntityWrite>>,
}

/// In-memory [`EntityStore`] for one dataset.
pub struct InMemoryEntityStore {
    dataset: String,
    state: RwLock<EntityState>,
    fail_mark: AtomicBool,
}

impl InMemoryEntityStore {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            state: RwLock::new(EntityState::default()),
            fail_mark: AtomicBool::new(false),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Make the next `mark_committed` fail, leaving the block staged.
    pub fn fail_next_mark(&self) {
        self.fail_mark.store(true, Ordering::SeqCst);
    }

    /// Number of stored versions of `key`, open or closed.
    pub fn version_count(&self, key: &EntityKey) -> usize {
        self.state.read().table.versions(key).len()
    }
}

#[async_trait]
impl BlockStore for InMemoryEntityStore {
    fn name(&self) -> &str {
        "entities"
    }

    async fn head(&self) -> Result<Option<BlockPtr>, StoreError> {
        Ok(self.state.read().ledger.head.clone())
    }

    async fn staged(&self) -> Result<Option<BlockPtr>, StoreError> {
        Ok(self.state.read().ledger.staged.as_ref().map(|(p, _)| p.clone()))
    }

    async fn mark_committed(&self, block: &BlockPtr) -> Result<(), StoreError> {
        injected(self.name(), &self.fail_mark)?;
        let mut state = self.state.write();
        let Some(writes) = state.ledger.take_staged(self.name(), block)? else {
            return Ok(());
        };
        for write in writes {
            let open = state.table.open(&write.key).map(|v| v.range.start);
            let changes = match write.data {
                Some(fields) => plan_put(open, block.number, fields),
                None => plan_drop(open, block.number),
            };
            state.table.apply(&write.key, changes);
        }
        state.ledger.advance(block);
        debug!(dataset = %self.dataset, block = %block, "Entities committed");
        Ok(())
    }

    async fn discard_staged(&self) -> Result<(), StoreError> {
        self.state.write().ledger.staged = None;
        Ok(())
    }

    async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.ledger.revert_to(block) {
            state.table.revert_to(block);
            debug!(dataset = %self.dataset, block, "Entities reverted");
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn stage_block(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError> {
        check_ops(block.number, ops)?;
        let mut state = self.state.write();
        if state.ledger.check(block)? == StageOutcome::AlreadyCommitted {
            return Ok(StageOutcome::AlreadyCommitted);
        }
        let base: BTreeMap<EntityKey, Fields> = ops
            .iter()
            .filter_map(|op| {
                let v = state.table.open(op.key())?;
                Some((op.key().clone(), v.value.clone()))
            })
            .collect();
        let writes = collapse_ops(ops, &base)?;
        state.ledger.staged = Some((block.clone(), writes));
        Ok(StageOutcome::Staged)
    }

    async fn get(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Entity>, StoreError> {
        Ok(self.state.read().table.at(key, at).map(|v| Entity {
            key: key.clone(),
            fields: v.value.clone(),
            range: v.range,
        }))
    }

    async fn find(&self, entity_type: &str, at: BlockNumber) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .state
            .read()
            .table
            .iter_at(at)
            .filter(|(k, _)| k.entity_type == entity_type)
            .map(|(k, v)| Entity {
                key: k.clone(),
                fields: v.value.clone(),
                range: v.range,
            })
            .collect())
    }

    async fn entity_count(&self, at: BlockNumber) -> Result<u64, StoreError> {
        Ok(self.state.read().table.count_at(at) as u64)
    }
}

// ─── Graph ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GraphState {
    nodes: VersionedTable<EntityKey, Fields>,
    edges: VersionedTable<EdgeKey, ()>,
    schema: GraphSchema,
    ledger: Ledger<Vec<GraphMutation>>,
}

/// In-memory [`GraphStore`] for one dataset.
pub struct InMemoryGraphStore {
    dataset: String,
    state: RwLock<GraphState>,
    fail_mark: AtomicBool,
}

impl InMemoryGraphStore {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            state: RwLock::new(GraphState::default()),
            fail_mark: AtomicBool::new(false),
        }
    }

    /// Make the next `mark_committed` fail, leaving the block staged.
    pub fn fail_next_mark(&self) {
        self.fail_mark.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockStore for InMemoryGraphStore {
    fn name(&self) -> &str {
        "graph"
    }

    async fn head(&self) -> Result<Option<BlockPtr>, StoreError> {
        Ok(self.state.read().ledger.head.clone())
    }

    async fn staged(&self) -> Result<Option<BlockPtr>, StoreError> {
        Ok(self.state.read().ledger.staged.as_ref().map(|(p, _)| p.clone()))
    }

    async fn mark_committed(&self, block: &BlockPtr) -> Result<(), StoreError> {
        injected(self.name(), &self.fail_mark)?;
        let mut state = self.state.write();
        let Some(mutations) = state.ledger.take_staged(self.name(), block)? else {
            return Ok(());
        };
        let n = block.number;
        for mutation in mutations {
            match mutation {
                GraphMutation::PutNode { key, properties } => {
                    let open = state.nodes.open(&key).map(|v| v.range.start);
                    state.nodes.apply(&key, plan_put(open, n, properties));
                }
                GraphMutation::RemoveNode { key } => {
                    let open = state.nodes.open(&key).map(|v| v.range.start);
                    state.nodes.apply(&key, plan_drop(open, n));
                }
                GraphMutation::PutEdge { edge } => {
                    if state.edges.open(&edge).is_none() {
                        state.edges.apply(&edge, plan_put(None, n, ()));
                    }
                }
                GraphMutation::RemoveEdge { edge } => {
                    let open = state.edges.open(&edge).map(|v| v.range.start);
                    state.edges.apply(&edge, plan_drop(open, n));
                }
            }
        }
        state.ledger.advance(block);
        debug!(dataset = %self.dataset, block = %block, "Graph committed");
        Ok(())
    }

    async fn discard_staged(&self) -> Result<(), StoreError> {
        self.state.write().ledger.staged = None;
        Ok(())
    }

    async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.ledger.revert_to(block) {
            state.nodes.revert_to(block);
            state.edges.revert_to(block);
            debug!(dataset = %self.dataset, block, "Graph reverted");
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn ensure_schema(&self, manifest: &Manifest) -> Result<(), StoreError> {
        self.state.write().schema.merge(GraphSchema::from_manifest(manifest));
        Ok(())
    }

    async fn stage_block(
        &self,
        block: &BlockPtr,
        mutations: &[GraphMutation],
    ) -> Result<StageOutcome, StoreError> {
        let mut state = self.state.write();
        for m in mutations {
            state.schema.check(m)?;
        }
        if state.ledger.check(block)? == StageOutcome::AlreadyCommitted {
            return Ok(StageOutcome::AlreadyCommitted);
        }
        state.ledger.staged = Some((block.clone(), mutations.to_vec()));
        Ok(StageOutcome::Staged)
    }

    async fn node(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Node>, StoreError> {
        Ok(self.state.read().nodes.at(key, at).map(|v| Node {
            key: key.clone(),
            properties: v.value.clone(),
            range: v.range,
        }))
    }

    async fn edges_from(&self, key: &EntityKey, at: BlockNumber) -> Result<Vec<Edge>, StoreError> {
        Ok(self
            .state
            .read()
            .edges
            .iter_at(at)
            .filter(|(e, _)| &e.from == key)
            .map(|(e, v)| Edge {
                key: e.clone(),
                range: v.range,
            })
            .collect())
    }

    async fn node_count(&self, at: BlockNumber) -> Result<u64, StoreError> {
        Ok(self.state.read().nodes.count_at(at) as u64)
    }
}
