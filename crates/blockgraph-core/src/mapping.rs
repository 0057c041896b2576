//! Mapping executor interface and a registry-based implementation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::{EntityKey, EntityOp, Fields};
use crate::error::IndexerError;
use crate::types::{Block, ChainEvent};

/// An event matched by the manifest, paired with the handler it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedEvent {
    pub handler: String,
    pub event: ChainEvent,
}

/// Turns a block and its matched events into entity ops.
///
/// Must be deterministic: replaying the same block yields the same ops.
pub trait MappingExecutor: Send + Sync {
    fn apply(&self, block: &Block, events: &[MatchedEvent]) -> Result<Vec<EntityOp>, IndexerError>;
}

/// Collects the ops a handler emits for one block.
pub struct MappingContext<'a> {
    block: &'a Block,
    ops: Vec<EntityOp>,
}

impl<'a> MappingContext<'a> {
    fn new(block: &'a Block) -> Self {
        Self {
            block,
            ops: Vec::new(),
        }
    }

    pub fn block(&self) -> &Block {
        self.block
    }

    pub fn create(&mut self, key: EntityKey, fields: Fields) {
        self.ops.push(EntityOp::create(self.block.number, key, fields));
    }

    pub fn update(&mut self, key: EntityKey, fields: Fields) {
        self.ops.push(EntityOp::update(self.block.number, key, fields));
    }

    pub fn remove(&mut self, key: EntityKey) {
        self.ops.push(EntityOp::remove(self.block.number, key));
    }
}

type HandlerFn = Arc<dyn Fn(&mut MappingContext<'_>, &ChainEvent) -> Result<(), String> + Send + Sync>;

/// [`MappingExecutor`] dispatching each event to the handler registered
/// under the name the manifest binds it to.
#[derive(Default, Clone)]
pub struct HandlerMapping {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut MappingContext<'_>, &ChainEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl MappingExecutor for HandlerMapping {
    fn apply(&self, block: &Block, events: &[MatchedEvent]) -> Result<Vec<EntityOp>, IndexerError> {
        let mut ctx = MappingContext::new(block);
        for matched in events {
            let handler = self
                .handlers
                .get(&matched.handler)
                .ok_or_else(|| IndexerError::Mapping {
                    handler: matched.handler.clone(),
                    reason: "no handler registered".into(),
                })?;
            handler(&mut ctx, &matched.event).map_err(|reason| IndexerError::Mapping {
                handler: matched.handler.clone(),
                reason,
            })?;
        }
        Ok(ctx.ops)
    }
}

impl std::fmt::Debug for HandlerMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerMapping").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fields;

    fn block() -> Block {
        Block::new(5, "0x05", "0x04", 60)
    }

    fn matched(handler: &str, to: &str) -> MatchedEvent {
        MatchedEvent {
            handler: handler.into(),
            event: ChainEvent {
                address: "0xToken".into(),
                topics: vec!["0xddf252ad".into(), to.into()],
                data: "0x".into(),
                tx_hash: "0x01".into(),
                block_number: 5,
                log_index: 0,
            },
        }
    }

    fn transfers() -> HandlerMapping {
        HandlerMapping::new().on("handleTransfer", |ctx, event| {
            let to = event.topics.get(1).ok_or("missing recipient")?;
            ctx.update(EntityKey::new("Account", to.as_str()), fields([("seen", true)]));
            Ok(())
        })
    }

    #[test]
    fn dispatches_by_handler_name() {
        let ops = transfers()
            .apply(&block(), &[matched("handleTransfer", "a1"), matched("handleTransfer", "a2")])
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.block_number() == 5));
        assert_eq!(ops[1].key().entity_id, "a2");
    }

    #[test]
    fn unknown_handler_is_mapping_error() {
        let err = transfers().apply(&block(), &[matched("handleSwap", "a1")]).unwrap_err();
        assert!(matches!(err, IndexerError::Mapping { handler, .. } if handler == "handleSwap"));
    }

    #[test]
    fn handler_failure_is_reported() {
        let mapping = HandlerMapping::new().on("boom", |_, _| Err("division by zero".into()));
        let err = mapping.apply(&block(), &[matched("boom", "a1")]).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
        assert!(err.is_dataset_fatal());
    }
}
