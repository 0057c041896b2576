//! Entities and the operations mappings emit against them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::BlockNumber;
use crate::versioned::BlockRange;

/// Entity field values, ordered by field name.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// `(entity_type, entity_id)`: identifies an entity across all its versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.entity_type, self.entity_id)
    }
}

/// A mutation emitted by a mapping, effective at `block_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntityOp {
    Create {
        key: EntityKey,
        fields: Fields,
        block_number: BlockNumber,
    },
    Update {
        key: EntityKey,
        fields: Fields,
        block_number: BlockNumber,
    },
    Remove {
        key: EntityKey,
        block_number: BlockNumber,
    },
}

impl EntityOp {
    pub fn create(block_number: BlockNumber, key: EntityKey, fields: Fields) -> Self {
        Self::Create {
            key,
            fields,
            block_number,
        }
    }

    pub fn update(block_number: BlockNumber, key: EntityKey, fields: Fields) -> Self {
        Self::Update {
            key,
            fields,
            block_number,
        }
    }

    pub fn remove(block_number: BlockNumber, key: EntityKey) -> Self {
        Self::Remove { key, block_number }
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Create { key, .. } | Self::Update { key, .. } | Self::Remove { key, .. } => key,
        }
    }

    pub fn block_number(&self) -> BlockNumber {
        match self {
            Self::Create { block_number, .. }
            | Self::Update { block_number, .. }
            | Self::Remove { block_number, .. } => *block_number,
        }
    }
}

/// One visible version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub fields: Fields,
    pub range: BlockRange,
}

impl Entity {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}

/// What an op does to the open version of its key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Write these fields as the new current version.
    Put(Fields),
    /// Close the current version.
    Drop,
}

/// Resolve `op` against the fields of the currently visible version.
///
/// Returns `Ok(None)` for a no-op (removing an absent entity). `Update`
/// merges into the current fields and inserts when there is none. `Create`
/// of a visible entity is rejected. The `id` field always mirrors the key.
pub fn resolve_op(op: &EntityOp, current: Option<&Fields>) -> Result<Option<Resolved>, StoreError> {
    match op {
        EntityOp::Create { key, fields, .. } => {
            if current.is_some() {
                return Err(StoreError::Constraint(format!("{key} already exists")));
            }
            let mut data = fields.clone();
            data.insert("id".into(), key.entity_id.clone().into());
            Ok(Some(Resolved::Put(data)))
        }
        EntityOp::Update { key, fields, .. } => {
            let mut data = current.cloned().unwrap_or_default();
            data.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            data.insert("id".into(), key.entity_id.clone().into());
            Ok(Some(Resolved::Put(data)))
        }
        EntityOp::Remove { .. } => Ok(current.map(|_| Resolved::Drop)),
    }
}

/// Check that every op targets `block_number`.
pub fn check_ops(block_number: BlockNumber, ops: &[EntityOp]) -> Result<(), StoreError> {
    match ops.iter().find(|op| op.block_number() != block_number) {
        Some(op) => Err(StoreError::InvalidOp(format!(
            "op on {} is for block {}, committed at {block_number}",
            op.key(),
            op.block_number()
        ))),
        None => Ok(()),
    }
}

/// The net effect of a block's ops on one key; `data == None` closes the
/// visible version. This is the staged payload of an entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub key: EntityKey,
    pub data: Option<Fields>,
}

/// Collapse a block's ops into one write per key.
///
/// `base` holds the visible fields, as of the store head, of every key the
/// ops touch. Keys whose ops cancel out (created and removed in the same
/// block with no prior version) are dropped from the result.
pub fn collapse_ops(
    ops: &[EntityOp],
    base: &BTreeMap<EntityKey, Fields>,
) -> Result<Vec<EntityWrite>, StoreError> {
    let mut overlay: BTreeMap<&EntityKey, Option<Fields>> = BTreeMap::new();
    for op in ops {
        let key = op.key();
        let current = match overlay.get(key) {
            Some(pending) => pending.as_ref(),
            None => base.get(key),
        };
        let next = match resolve_op(op, current)? {
            Some(Resolved::Put(data)) => Some(data),
            Some(Resolved::Drop) | None => None,
        };
        overlay.insert(key, next);
    }
    Ok(overlay
        .into_iter()
        .filter(|(key, data)| data.is_some() || base.contains_key(*key))
        .map(|(key, data)| EntityWrite {
            key: key.clone(),
            data,
        })
        .collect())
}

/// Build a [`Fields`] map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> EntityKey {
        EntityKey::new("Token", "t1")
    }

    #[test]
    fn create_adds_id() {
        let op = EntityOp::create(3, key(), fields([("symbol", "ABC")]));
        let Some(Resolved::Put(data)) = resolve_op(&op, None).unwrap() else {
            panic!("expected put");
        };
        assert_eq!(data["id"], json!("t1"));
        assert_eq!(data["symbol"], json!("ABC"));
    }

    #[test]
    fn create_existing_is_rejected() {
        let op = EntityOp::create(3, key(), Fields::new());
        let current = fields([("id", "t1")]);
        assert!(matches!(
            resolve_op(&op, Some(&current)),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn update_merges_fields() {
        let current = fields([("id", json!("t1")), ("symbol", json!("ABC")), ("supply", json!(1))]);
        let op = EntityOp::update(4, key(), fields([("supply", 2)]));
        let Some(Resolved::Put(data)) = resolve_op(&op, Some(&current)).unwrap() else {
            panic!("expected put");
        };
        assert_eq!(data["symbol"], json!("ABC"));
        assert_eq!(data["supply"], json!(2));
    }

    #[test]
    fn remove_absent_is_noop() {
        let op = EntityOp::remove(4, key());
        assert_eq!(resolve_op(&op, None).unwrap(), None);
    }

    #[test]
    fn ops_must_match_block() {
        let ops = vec![
            EntityOp::remove(4, key()),
            EntityOp::remove(5, EntityKey::new("Token", "t2")),
        ];
        assert!(check_ops(4, &ops[..1]).is_ok());
        assert!(matches!(check_ops(4, &ops), Err(StoreError::InvalidOp(_))));
    }

    #[test]
    fn collapse_keeps_last_write_per_key() {
        let k2 = EntityKey::new("Token", "t2");
        let ops = vec![
            EntityOp::create(5, key(), fields([("supply", 1)])),
            EntityOp::update(5, key(), fields([("supply", 2)])),
            EntityOp::create(5, k2.clone(), Fields::new()),
            EntityOp::remove(5, k2),
        ];
        let writes = collapse_ops(&ops, &BTreeMap::new()).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data.as_ref().unwrap()["supply"], json!(2));
    }

    #[test]
    fn collapse_remove_then_recreate() {
        let mut base = BTreeMap::new();
        base.insert(key(), fields([("id", json!("t1")), ("supply", json!(7))]));
        let ops = vec![
            EntityOp::remove(6, key()),
            EntityOp::create(6, key(), fields([("supply", 1)])),
        ];
        let writes = collapse_ops(&ops, &base).unwrap();
        let data = writes[0].data.as_ref().unwrap();
        assert_eq!(data["supply"], json!(1));

        let dup = vec![EntityOp::create(6, key(), Fields::new())];
        assert!(collapse_ops(&dup, &base).is_err());
    }

    #[test]
    fn op_serde_is_tagged() {
        let op = EntityOp::remove(9, key());
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["op"], json!("remove"));
        let back: EntityOp = serde_json::from_value(v).unwrap();
        assert_eq!(back, op);
    }
}
