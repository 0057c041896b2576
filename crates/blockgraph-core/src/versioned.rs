//! Block-range versioning shared by every backend.
//!
//! A record's history is a list of versions with ranges `[start, end)`. At
//! most one version per key is open (`end == None`) and ranges never overlap.
//! Writes are planned as [`VersionChange`]s so in-memory and SQL backends
//! apply exactly the same transitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::BlockNumber;

/// Half-open block range `[start, end)`; `end == None` means still visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub end: Option<BlockNumber>,
}

impl BlockRange {
    pub fn open(start: BlockNumber) -> Self {
        Self { start, end: None }
    }

    /// Returns `true` if a reader pinned to `block` sees this range.
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.start <= block && self.end.map_or(true, |end| block < end)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// One transition of the version list of a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionChange<V> {
    /// Close the open version that started at `start`, at block `end`.
    Close { start: BlockNumber, end: BlockNumber },
    /// Delete the version that started at `start` (it was opened in this block).
    Delete { start: BlockNumber },
    /// Overwrite the value of the version opened at `start` in this block.
    Replace { start: BlockNumber, value: V },
    /// Open a new version at `start`.
    Open { start: BlockNumber, value: V },
}

/// Plan writing `value` at `block` given the start of the currently open version.
pub fn plan_put<V>(open_start: Option<BlockNumber>, block: BlockNumber, value: V) -> Vec<VersionChange<V>> {
    match open_start {
        Some(start) if start == block => vec![VersionChange::Replace { start, value }],
        Some(start) => vec![
            VersionChange::Close { start, end: block },
            VersionChange::Open { start: block, value },
        ],
        None => vec![VersionChange::Open { start: block, value }],
    }
}

/// Plan removing the record at `block`.
pub fn plan_drop<V>(open_start: Option<BlockNumber>, block: BlockNumber) -> Vec<VersionChange<V>> {
    match open_start {
        Some(start) if start == block => vec![VersionChange::Delete { start }],
        Some(start) => vec![VersionChange::Close { start, end: block }],
        None => Vec::new(),
    }
}

/// A single version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version<V> {
    pub range: BlockRange,
    pub value: V,
}

/// In-memory versioned table, used by the in-memory backends.
#[derive(Debug, Clone)]
pub struct VersionedTable<K, V> {
    rows: BTreeMap<K, Vec<Version<V>>>,
}

impl<K, V> Default for VersionedTable<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> VersionedTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently open version of `key`.
    pub fn open(&self, key: &K) -> Option<&Version<V>> {
        self.rows.get(key)?.iter().find(|v| v.range.is_open())
    }

    /// The version of `key` visible at `block`.
    pub fn at(&self, key: &K, block: BlockNumber) -> Option<&Version<V>> {
        self.rows.get(key)?.iter().find(|v| v.range.contains(block))
    }

    /// Every `(key, version)` visible at `block`, in key order.
    pub fn iter_at(&self, block: BlockNumber) -> impl Iterator<Item = (&K, &Version<V>)> {
        self.rows.iter().filter_map(move |(k, versions)| {
            versions
                .iter()
                .find(|v| v.range.contains(block))
                .map(|v| (k, v))
        })
    }

    /// Number of keys visible at `block`.
    pub fn count_at(&self, block: BlockNumber) -> usize {
        self.iter_at(block).count()
    }

    /// Every version of every key, for inspection in tests.
    pub fn versions(&self, key: &K) -> &[Version<V>] {
        self.rows.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn apply(&mut self, key: &K, changes: Vec<VersionChange<V>>) {
        for change in changes {
            let versions = self.rows.entry(key.clone()).or_default();
            match change {
                VersionChange::Close { start, end } => {
                    if let Some(v) = versions.iter_mut().find(|v| v.range.start == start) {
                        v.range.end = Some(end);
                    }
                }
                VersionChange::Delete { start } => versions.retain(|v| v.range.start != start),
                VersionChange::Replace { start, value } => {
                    if let Some(v) = versions.iter_mut().find(|v| v.range.start == start) {
                        v.value = value;
                    }
                }
                VersionChange::Open { start, value } => versions.push(Version {
                    range: BlockRange::open(start),
                    value,
                }),
            }
            if versions.is_empty() {
                self.rows.remove(key);
            }
        }
    }

    /// Make the table look as if no block above `block` was ever applied:
    /// versions started above it are deleted, versions closed above it reopen.
    pub fn revert_to(&mut self, block: BlockNumber) {
        self.rows.retain(|_, versions| {
            versions.retain(|v| v.range.start <= block);
            for v in versions.iter_mut() {
                if v.range.end.map_or(false, |end| end > block) {
                    v.range.end = None;
                }
            }
            !versions.is_empty()
        });
    }
}
