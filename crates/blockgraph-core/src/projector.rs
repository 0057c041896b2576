//! Derives graph mutations from a block's entity ops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::entity::{resolve_op, EntityKey, EntityOp, Fields, Resolved};
use crate::error::StoreError;
use crate::graph::{EdgeKey, GraphMutation};
use crate::manifest::Manifest;
use crate::store::GraphStore;
use crate::types::BlockPtr;

/// Turns entity ops into node/edge mutations for a [`GraphStore`].
///
/// Nodes mirror entities one to one. Each relationship field declared in
/// the manifest yields one edge per referenced id; a field may hold a single
/// id or an array of ids. Only edges whose existence changes are emitted.
pub struct GraphProjector {
    store: Arc<dyn GraphStore>,
    /// entity type → [(field, target type)]
    relationships: BTreeMap<String, Vec<(String, String)>>,
}

impl GraphProjector {
    pub fn new(store: Arc<dyn GraphStore>, manifest: &Manifest) -> Self {
        let mut relationships: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for rel in manifest.relationships() {
            relationships
                .entry(rel.entity_type)
                .or_default()
                .push((rel.field, rel.target));
        }
        Self {
            store,
            relationships,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Project `ops` for `block` against the graph as of its head.
    pub async fn project(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<Vec<GraphMutation>, StoreError> {
        let head = self.store.head().await?;
        let mut base: BTreeMap<EntityKey, Option<Fields>> = BTreeMap::new();
        let mut overlay: BTreeMap<EntityKey, Option<Fields>> = BTreeMap::new();

        for op in ops {
            let key = op.key();
            if !base.contains_key(key) {
                let node = match &head {
                    Some(h) => self.store.node(key, h.number).await?,
                    None => None,
                };
                base.insert(key.clone(), node.map(|n| n.properties));
            }
            let current = match overlay.get(key) {
                Some(pending) => pending.as_ref(),
                None => base.get(key).and_then(Option::as_ref),
            };
            let next = match resolve_op(op, current)? {
                Some(Resolved::Put(props)) => Some(props),
                Some(Resolved::Drop) | None => None,
            };
            overlay.insert(key.clone(), next);
        }

        let mut mutations = Vec::new();
        for (key, after) in overlay {
            let before = base.remove(&key).flatten();
            let old_edges = self.edges_of(&key, before.as_ref());
            let new_edges = self.edges_of(&key, after.as_ref());

            match (&before, after) {
                (_, Some(props)) if before.as_ref() != Some(&props) => {
                    mutations.push(GraphMutation::PutNode {
                        key: key.clone(),
                        properties: props,
                    });
                }
                (Some(_), None) => mutations.push(GraphMutation::RemoveNode { key: key.clone() }),
                _ => {}
            }
            mutations.extend(
                old_edges
                    .difference(&new_edges)
                    .map(|edge| GraphMutation::RemoveEdge { edge: edge.clone() }),
            );
            mutations.extend(
                new_edges
                    .difference(&old_edges)
                    .map(|edge| GraphMutation::PutEdge { edge: edge.clone() }),
            );
        }

        debug!(block = %block, ops = ops.len(), mutations = mutations.len(), "Projected graph");
        Ok(mutations)
    }

    fn edges_of(&self, key: &EntityKey, props: Option<&Fields>) -> BTreeSet<EdgeKey> {
        let (Some(props), Some(rels)) = (props, self.relationships.get(&key.entity_type)) else {
            return BTreeSet::new();
        };
        let mut edges = BTreeSet::new();
        for (field, target) in rels {
            let ids: Vec<&str> = match props.get(field) {
                Some(serde_json::Value::String(id)) => vec![id.as_str()],
                Some(serde_json::Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
                _ => continue,
            };
            for id in ids {
                edges.insert(EdgeKey::new(field.clone(), key.clone(), EntityKey::new(target.clone(), id)));
            }
        }
        edges
    }
}
