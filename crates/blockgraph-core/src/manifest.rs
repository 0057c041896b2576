//! Dataset manifests and the resolver that loads them.
//!
//! A manifest names the contracts to watch, binds their events to mapping
//! handlers and declares the entity schema, including which fields are
//! relationships to other entities.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexerError;
use crate::types::{BlockNumber, ChainEvent};

/// An event of a data source bound to a named mapping handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandlerDef {
    /// Human-readable signature, e.g. `Transfer(address,address,uint256)`.
    pub event: String,
    /// Signature hash matched against `topics[0]`.
    pub topic0: String,
    /// Name of the mapping handler invoked for this event.
    pub handler: String,
}

/// A contract (or any contract, when `address` is `None`) to index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub start_block: BlockNumber,
    #[serde(default)]
    pub event_handlers: Vec<EventHandlerDef>,
}

impl DataSource {
    fn watches(&self, event: &ChainEvent) -> bool {
        event.block_number >= self.start_block
            && self
                .address
                .as_ref()
                .map_or(true, |a| a.eq_ignore_ascii_case(&event.address))
    }
}

/// One field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Target entity type when this field is a relationship.
    #[serde(default)]
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

/// A relationship field: `entity_type.field` points at `target` entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Relationship {
    pub entity_type: String,
    pub field: String,
    pub target: String,
}

/// A resolved dataset manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub data_sources: Vec<DataSource>,
    #[serde(default)]
    pub entities: Vec<EntityTypeDef>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| IndexerError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests the pipeline cannot run.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.data_sources.is_empty() {
            return Err(IndexerError::Manifest(format!(
                "manifest '{}' has no data sources",
                self.name
            )));
        }
        let mut types = BTreeSet::new();
        for entity in &self.entities {
            if !types.insert(entity.name.as_str()) {
                return Err(IndexerError::Manifest(format!(
                    "entity type '{}' declared twice",
                    entity.name
                )));
            }
        }
        for rel in self.relationships() {
            if !types.contains(rel.target.as_str()) {
                return Err(IndexerError::Manifest(format!(
                    "{}.{} references unknown entity type '{}'",
                    rel.entity_type, rel.field, rel.target
                )));
            }
        }
        for source in &self.data_sources {
            if let Some(h) = source.event_handlers.iter().find(|h| h.handler.is_empty()) {
                return Err(IndexerError::Manifest(format!(
                    "data source '{}' binds '{}' to an empty handler name",
                    source.name, h.event
                )));
            }
        }
        Ok(())
    }

    /// Lowest start block across data sources.
    pub fn start_block(&self) -> BlockNumber {
        self.data_sources
            .iter()
            .map(|s| s.start_block)
            .min()
            .unwrap_or_default()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.name.as_str())
    }

    /// Every relationship field declared in the schema.
    pub fn relationships(&self) -> Vec<Relationship> {
        self.entities
            .iter()
            .flat_map(|e| {
                e.fields.iter().filter_map(move |f| {
                    f.references.as_ref().map(|target| Relationship {
                        entity_type: e.name.clone(),
                        field: f.name.clone(),
                        target: target.clone(),
                    })
                })
            })
            .collect()
    }

    /// The handler bound to `event`, if any data source watches it.
    pub fn handler_for(&self, event: &ChainEvent) -> Option<&EventHandlerDef> {
        let topic0 = event.topic0()?;
        self.data_sources
            .iter()
            .filter(|s| s.watches(event))
            .flat_map(|s| s.event_handlers.iter())
            .find(|h| h.topic0.eq_ignore_ascii_case(topic0))
    }
}

/// Loads manifests by content address.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<Manifest, IndexerError>;
}

/// Resolver over manifests registered in memory.
#[derive(Default)]
pub struct StaticManifestResolver {
    manifests: HashMap<String, Manifest>,
}

impl StaticManifestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: impl Into<String>, manifest: Manifest) -> Self {
        self.manifests.insert(address.into(), manifest);
        self
    }
}

#[async_trait]
impl ManifestResolver for StaticManifestResolver {
    async fn resolve(&self, address: &str) -> Result<Manifest, IndexerError> {
        let manifest = self
            .manifests
            .get(address)
            .cloned()
            .ok_or_else(|| IndexerError::Manifest(format!("no manifest at '{address}'")))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Resolver reading `<dir>/<address>.json`.
pub struct FileManifestResolver {
    dir: PathBuf,
}

impl FileManifestResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ManifestResolver for FileManifestResolver {
    async fn resolve(&self, address: &str) -> Result<Manifest, IndexerError> {
        if address.contains(['/', '\\']) || address.starts_with('.') {
            return Err(IndexerError::Manifest(format!(
                "invalid manifest address '{address}'"
            )));
        }
        let path = self.dir.join(format!("{address}.json"));
        debug!(path = %path.display(), "Loading manifest");
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| IndexerError::Manifest(format!("{}: {e}", path.display())))?;
        Manifest::from_json(&json)
    }
}
