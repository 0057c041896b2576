//! Checkpoint manager: persists a dataset's cursor for crash recovery.
//!
//! A checkpoint is written only after both stores committed the block it
//! points at. It also carries the dataset's failure record: a dataset with a
//! recorded fatal error refuses to start until an operator clears it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cursor::Cursor;
use crate::error::IndexerError;

/// A persisted checkpoint for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Dataset identifier.
    pub dataset: String,
    /// Position in the chain; `None` if the dataset failed before its first block.
    pub cursor: Option<Cursor>,
    /// Fatal error recorded when the dataset was halted.
    pub fatal_error: Option<String>,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn block_number(&self) -> Option<u64> {
        self.cursor.as_ref().map(|c| c.last_processed_block.number)
    }
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include [`MemoryCheckpointStore`] and the SQLite and
/// Postgres storages in `blockgraph-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting a dataset).
    async fn delete(&self, dataset: &str) -> Result<(), IndexerError>;
}

/// Manages checkpoint reads/writes for one dataset.
pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
    dataset: String,
    /// How often to save (every N blocks).
    save_interval: u64,
    /// Blocks since the last save.
    counter: u64,
}

impl CheckpointManager {
    pub fn new(store: Box<dyn CheckpointStore>, dataset: impl Into<String>, save_interval: u64) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            save_interval: save_interval.max(1),
            counter: 0,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// The full checkpoint record, including any failure.
    pub async fn checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.dataset).await
    }

    /// The saved cursor, if any.
    pub async fn load(&self) -> Result<Option<Cursor>, IndexerError> {
        Ok(self.checkpoint().await?.and_then(|cp| cp.cursor))
    }

    /// Save the cursor now (used on reorg recovery and shutdown).
    pub async fn persist(&mut self, cursor: &Cursor) -> Result<(), IndexerError> {
        let cp = Checkpoint {
            dataset: self.dataset.clone(),
            cursor: Some(cursor.clone()),
            fatal_error: None,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await?;
        self.counter = 0;
        debug!(dataset = %self.dataset, block = %cursor.ptr(), "Checkpoint saved");
        Ok(())
    }

    /// Save the cursor every `save_interval` calls.
    ///
    /// Call this after each block is committed to both stores.
    pub async fn maybe_persist(&mut self, cursor: &Cursor) -> Result<bool, IndexerError> {
        self.counter += 1;
        if self.counter < self.save_interval {
            return Ok(false);
        }
        self.persist(cursor).await?;
        Ok(true)
    }

    /// Record a fatal error; the dataset will not start until it is cleared.
    pub async fn record_failure(&self, reason: &str) -> Result<(), IndexerError> {
        let mut cp = self.checkpoint().await?.unwrap_or_else(|| Checkpoint {
            dataset: self.dataset.clone(),
            cursor: None,
            fatal_error: None,
            updated_at: 0,
        });
        cp.fatal_error = Some(reason.to_string());
        cp.updated_at = chrono::Utc::now().timestamp();
        warn!(dataset = %self.dataset, reason, "Recording dataset failure");
        self.store.save(cp).await
    }

    /// Clear a recorded failure. Returns `false` if there was none.
    pub async fn clear_failure(&self) -> Result<bool, IndexerError> {
        let Some(mut cp) = self.checkpoint().await? else {
            return Ok(false);
        };
        if cp.fatal_error.take().is_none() {
            return Ok(false);
        }
        cp.updated_at = chrono::Utc::now().timestamp();
        self.store.save(cp).await?;
        info!(dataset = %self.dataset, "Cleared dataset failure");
        Ok(true)
    }

    /// Remove the checkpoint so the dataset restarts from its start block.
    pub async fn delete(&self) -> Result<(), IndexerError> {
        self.store.delete(&self.dataset).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral pipelines.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().get(dataset).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.data.lock().insert(checkpoint.dataset.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, dataset: &str) -> Result<(), IndexerError> {
        self.data.lock().remove(dataset);
        Ok(())
    }
}

/// Lets several managers (or a manager and a status reader) share one store.
#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, IndexerError> {
        (**self).load(dataset).await
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        (**self).save(checkpoint).await
    }

    async fn delete(&self, dataset: &str) -> Result<(), IndexerError> {
        (**self).delete(dataset).await
    }
}
