//! Graph view of the entity store: one node per entity, one edge per
//! relationship reference.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKey, Fields};
use crate::error::StoreError;
use crate::manifest::Manifest;
use crate::versioned::BlockRange;

/// A node version. The node label is the entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: EntityKey,
    pub properties: Fields,
    pub range: BlockRange,
}

/// Identity of an edge: `from --label--> to`, where `label` is the
/// relationship field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub label: String,
    pub from: EntityKey,
    pub to: EntityKey,
}

impl EdgeKey {
    pub fn new(label: impl Into<String>, from: EntityKey, to: EntityKey) -> Self {
        Self {
            label: label.into(),
            from,
            to,
        }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -{}-> {}", self.from, self.label, self.to)
    }
}

/// An edge version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub range: BlockRange,
}

/// A change to the graph, staged per block like entity writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphMutation {
    PutNode { key: EntityKey, properties: Fields },
    RemoveNode { key: EntityKey },
    PutEdge { edge: EdgeKey },
    RemoveEdge { edge: EdgeKey },
}

/// Node and edge labels a graph store accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub node_labels: BTreeSet<String>,
    /// `(from_label, edge_label, to_label)`.
    pub edge_labels: BTreeSet<(String, String, String)>,
}

impl GraphSchema {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            node_labels: manifest.entity_types().map(str::to_string).collect(),
            edge_labels: manifest
                .relationships()
                .into_iter()
                .map(|r| (r.entity_type, r.field, r.target))
                .collect(),
        }
    }

    /// Add every label of `other`.
    pub fn merge(&mut self, other: GraphSchema) {
        self.node_labels.extend(other.node_labels);
        self.edge_labels.extend(other.edge_labels);
    }

    pub fn check(&self, mutation: &GraphMutation) -> Result<(), StoreError> {
        match mutation {
            GraphMutation::PutNode { key, .. } | GraphMutation::RemoveNode { key } => {
                if !self.node_labels.contains(&key.entity_type) {
                    return Err(StoreError::Constraint(format!(
                        "unknown node label '{}'",
                        key.entity_type
                    )));
                }
            }
            GraphMutation::PutEdge { edge } | GraphMutation::RemoveEdge { edge } => {
                let label = (
                    edge.from.entity_type.clone(),
                    edge.label.clone(),
                    edge.to.entity_type.clone(),
                );
                if !self.edge_labels.contains(&label) {
                    return Err(StoreError::Constraint(format!("unknown edge label for {edge}")));
                }
            }
        }
        Ok(())
    }
}
