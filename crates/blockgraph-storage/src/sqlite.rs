//! SQLite storage backend for blockgraph.
//!
//! One database holds every dataset: entity versions, graph nodes and edges,
//! per-store block hashes, heads and staged blocks, and checkpoints. Each
//! mark and revert runs in a single transaction.
//!
//! # Usage
//! ```rust,no_run
//! use blockgraph_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let storage = SqliteStorage::open("./blockgraph.db").await?;
//! let entities = storage.entity_store("tokens");
//!
//! // In-memory (tests / ephemeral)
//! let storage = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use blockgraph_core::checkpoint::{Checkpoint, CheckpointStore};
use blockgraph_core::entity::{check_ops, collapse_ops, Entity, EntityKey, EntityOp, EntityWrite, Fields};
use blockgraph_core::error::{IndexerError, StoreError};
use blockgraph_core::graph::{Edge, EdgeKey, GraphMutation, GraphSchema, Node};
use blockgraph_core::manifest::Manifest;
use blockgraph_core::store::{check_sequence, BlockStore, EntityStore, GraphStore, StageOutcome};
use blockgraph_core::types::{BlockNumber, BlockPtr};
use blockgraph_core::versioned::{plan_drop, plan_put, BlockRange, VersionChange};

use crate::sqlx_error;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        dataset      TEXT    NOT NULL,
        entity_type  TEXT    NOT NULL,
        entity_id    TEXT    NOT NULL,
        block_start  INTEGER NOT NULL,
        block_end    INTEGER,
        data         TEXT    NOT NULL,
        PRIMARY KEY (dataset, entity_type, entity_id, block_start)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entities_open
        ON entities (dataset, entity_type, entity_id) WHERE block_end IS NULL",
    "CREATE TABLE IF NOT EXISTS graph_nodes (
        dataset      TEXT    NOT NULL,
        label        TEXT    NOT NULL,
        node_id      TEXT    NOT NULL,
        block_start  INTEGER NOT NULL,
        block_end    INTEGER,
        properties   TEXT    NOT NULL,
        PRIMARY KEY (dataset, label, node_id, block_start)
    )",
    "CREATE TABLE IF NOT EXISTS graph_edges (
        dataset      TEXT    NOT NULL,
        label        TEXT    NOT NULL,
        from_label   TEXT    NOT NULL,
        from_id      TEXT    NOT NULL,
        to_label     TEXT    NOT NULL,
        to_id        TEXT    NOT NULL,
        block_start  INTEGER NOT NULL,
        block_end    INTEGER,
        PRIMARY KEY (dataset, from_label, from_id, label, to_label, to_id, block_start)
    )",
    "CREATE TABLE IF NOT EXISTS graph_schema (
        dataset      TEXT NOT NULL,
        kind         TEXT NOT NULL,
        from_label   TEXT NOT NULL,
        label        TEXT NOT NULL,
        to_label     TEXT NOT NULL,
        PRIMARY KEY (dataset, kind, from_label, label, to_label)
    )",
    "CREATE TABLE IF NOT EXISTS block_hashes (
        dataset      TEXT    NOT NULL,
        store        TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        PRIMARY KEY (dataset, store, block_number)
    )",
    "CREATE TABLE IF NOT EXISTS store_heads (
        dataset      TEXT    NOT NULL,
        store        TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        PRIMARY KEY (dataset, store)
    )",
    "CREATE TABLE IF NOT EXISTS staged_blocks (
        dataset      TEXT    NOT NULL,
        store        TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        payload      TEXT    NOT NULL,
        PRIMARY KEY (dataset, store)
    )",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        dataset      TEXT    NOT NULL PRIMARY KEY,
        cursor       TEXT,
        fatal_error  TEXT,
        updated_at   INTEGER NOT NULL
    )",
];

/// Tables partitioned by dataset, cleared by [`SqliteStorage::drop_dataset`].
const DATASET_TABLES: &[&str] = &[
    "entities",
    "graph_nodes",
    "graph_edges",
    "graph_schema",
    "block_hashes",
    "store_heads",
    "staged_blocks",
    "checkpoints",
];

/// SQLite database shared by the stores of every dataset.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./blockgraph.db"`) or a full
    /// SQLite URL (`"sqlite:./blockgraph.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| sqlx_error("sqlite", e))?;

        let storage = Self { pool };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single connection that is never recycled; every connection to
    /// `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| sqlx_error("sqlite", e))?;

        let storage = Self { pool };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StoreError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(|e| sqlx_error("sqlite", e))?;
        }
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| sqlx_error("sqlite", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn entity_store(&self, dataset: impl Into<String>) -> SqliteEntityStore {
        SqliteEntityStore {
            pool: self.pool.clone(),
            part: Partition::new(dataset, "entities"),
        }
    }

    pub fn graph_store(&self, dataset: impl Into<String>) -> SqliteGraphStore {
        SqliteGraphStore {
            pool: self.pool.clone(),
            part: Partition::new(dataset, "graph"),
        }
    }

    /// Every dataset with a checkpoint or committed blocks.
    pub async fn datasets(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT dataset FROM checkpoints
             UNION SELECT dataset FROM store_heads
             ORDER BY dataset",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sqlx_error("sqlite", e))?;
        Ok(rows.iter().map(|r| r.get("dataset")).collect())
    }

    /// Delete every row belonging to `dataset`.
    pub async fn drop_dataset(&self, dataset: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_error("sqlite", e))?;
        for table in DATASET_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE dataset = ?"))
                .bind(dataset)
                .execute(&mut *tx)
                .await
                .map_err(|e| sqlx_error("sqlite", e))?;
        }
        tx.commit().await.map_err(|e| sqlx_error("sqlite", e))?;
        debug!(dataset, "Dropped dataset");
        Ok(())
    }
}

// ─── Commit bookkeeping ──────────────────────────────────────────────────────

/// The `(dataset, store)` partition of the bookkeeping tables.
struct Partition {
    dataset: String,
    store: &'static str,
}

impl Partition {
    fn new(dataset: impl Into<String>, store: &'static str) -> Self {
        Self {
            dataset: dataset.into(),
            store,
        }
    }

    fn err(&self) -> impl Fn(sqlx::Error) -> StoreError + '_ {
        move |e| sqlx_error(self.store, e)
    }

    async fn head(&self, conn: &mut SqliteConnection) -> Result<Option<BlockPtr>, StoreError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash FROM store_heads WHERE dataset = ? AND store = ?",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .fetch_optional(&mut *conn)
        .await
        .map_err(self.err())?;
        Ok(row.map(|r| ptr_from_row(&r)))
    }

    async fn recorded_hash(
        &self,
        conn: &mut SqliteConnection,
        number: BlockNumber,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT block_hash FROM block_hashes
             WHERE dataset = ? AND store = ? AND block_number = ?",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .bind(number as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(self.err())?;
        Ok(row.map(|r| r.get("block_hash")))
    }

    async fn check(&self, conn: &mut SqliteConnection, block: &BlockPtr) -> Result<StageOutcome, StoreError> {
        let head = self.head(conn).await?;
        let recorded = self.recorded_hash(conn, block.number).await?;
        check_sequence(head.as_ref(), recorded.as_deref(), block)
    }

    async fn staged(&self, conn: &mut SqliteConnection) -> Result<Option<(BlockPtr, String)>, StoreError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, payload FROM staged_blocks
             WHERE dataset = ? AND store = ?",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .fetch_optional(&mut *conn)
        .await
        .map_err(self.err())?;
        Ok(row.map(|r| (ptr_from_row(&r), r.get("payload"))))
    }

    async fn stage(&self, conn: &mut SqliteConnection, block: &BlockPtr, payload: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO staged_blocks (dataset, store, block_number, block_hash, payload)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .bind(block.number as i64)
        .bind(&block.hash)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .map_err(self.err())?;
        Ok(())
    }

    async fn clear_staged(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM staged_blocks WHERE dataset = ? AND store = ?")
            .bind(&self.dataset)
            .bind(self.store)
            .execute(&mut *conn)
            .await
            .map_err(self.err())?;
        Ok(())
    }

    /// Fetch the payload staged for `block`. `None` when `block` is already the head.
    async fn take_staged(&self, conn: &mut SqliteConnection, block: &BlockPtr) -> Result<Option<String>, StoreError> {
        if self.head(conn).await?.as_ref() == Some(block) {
            return Ok(None);
        }
        match self.staged(conn).await? {
            Some((ptr, payload)) if &ptr == block => {
                self.clear_staged(conn).await?;
                Ok(Some(payload))
            }
            _ => Err(StoreError::InvalidOp(format!(
                "{}: block {block} is not staged",
                self.store
            ))),
        }
    }

    async fn advance(&self, conn: &mut SqliteConnection, block: &BlockPtr) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO block_hashes (dataset, store, block_number, block_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .bind(block.number as i64)
        .bind(&block.hash)
        .execute(&mut *conn)
        .await
        .map_err(self.err())?;
        self.set_head(conn, Some(block)).await
    }

    async fn set_head(&self, conn: &mut SqliteConnection, head: Option<&BlockPtr>) -> Result<(), StoreError> {
        let query = match head {
            Some(block) => sqlx::query(
                "INSERT OR REPLACE INTO store_heads (dataset, store, block_number, block_hash)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&self.dataset)
            .bind(self.store)
            .bind(block.number as i64)
            .bind(&block.hash),
            None => sqlx::query("DELETE FROM store_heads WHERE dataset = ? AND store = ?")
                .bind(&self.dataset)
                .bind(self.store),
        };
        query.execute(&mut *conn).await.map_err(self.err())?;
        Ok(())
    }

    /// Roll the bookkeeping back to `block`. Returns `false` if nothing is above it.
    async fn revert_to(&self, conn: &mut SqliteConnection, block: BlockNumber) -> Result<bool, StoreError> {
        let Some(head) = self.head(conn).await? else {
            return Ok(false);
        };
        if block >= head.number {
            return Ok(false);
        }
        sqlx::query("DELETE FROM block_hashes WHERE dataset = ? AND store = ? AND block_number > ?")
            .bind(&self.dataset)
            .bind(self.store)
            .bind(block as i64)
            .execute(&mut *conn)
            .await
            .map_err(self.err())?;
        let new_head = sqlx::query(
            "SELECT block_number, block_hash FROM block_hashes
             WHERE dataset = ? AND store = ? ORDER BY block_number DESC LIMIT 1",
        )
        .bind(&self.dataset)
        .bind(self.store)
        .fetch_optional(&mut *conn)
        .await
        .map_err(self.err())?
        .map(|r| ptr_from_row(&r));
        self.set_head(conn, new_head.as_ref()).await?;
        self.clear_staged(conn).await?;
        Ok(true)
    }
}

fn ptr_from_row(row: &SqliteRow) -> BlockPtr {
    BlockPtr::new(row.get::<i64, _>("block_number") as u64, row.get::<String, _>("block_hash"))
}

fn range_from_row(row: &SqliteRow) -> BlockRange {
    BlockRange {
        start: row.get::<i64, _>("block_start") as u64,
        end: row.get::<Option<i64>, _>("block_end").map(|e| e as u64),
    }
}

// ─── Versioned rows ──────────────────────────────────────────────────────────

/// One record of a block-range versioned table, addressed by its key columns.
struct VersionedRow<'a> {
    table: &'static str,
    key_columns: &'static [&'static str],
    key: [&'a str; 2],
    /// Column holding the JSON value; `None` for tables with no payload.
    value_column: Option<&'static str>,
}

impl VersionedRow<'_> {
    fn key_clause(&self) -> String {
        self.key_columns.iter().map(|c| format!(" AND {c} = ?")).collect()
    }

    async fn open_start(&self, conn: &mut SqliteConnection, dataset: &str) -> Result<Option<BlockNumber>, sqlx::Error> {
        let sql = format!(
            "SELECT block_start FROM {} WHERE dataset = ?{} AND block_end IS NULL",
            self.table,
            self.key_clause()
        );
        let mut query = sqlx::query(&sql).bind(dataset);
        for k in self.key {
            query = query.bind(k);
        }
        Ok(query
            .fetch_optional(&mut *conn)
            .await?
            .map(|r| r.get::<i64, _>("block_start") as u64))
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        dataset: &str,
        change: VersionChange<String>,
    ) -> Result<(), sqlx::Error> {
        let (t, k) = (self.table, self.key_clause());
        match change {
            VersionChange::Close { start, end } => {
                let sql = format!("UPDATE {t} SET block_end = ? WHERE dataset = ?{k} AND block_start = ?");
                let mut query = sqlx::query(&sql).bind(end as i64).bind(dataset);
                for key in self.key {
                    query = query.bind(key);
                }
                query.bind(start as i64).execute(&mut *conn).await?;
            }
            VersionChange::Delete { start } => {
                let sql = format!("DELETE FROM {t} WHERE dataset = ?{k} AND block_start = ?");
                let mut query = sqlx::query(&sql).bind(dataset);
                for key in self.key {
                    query = query.bind(key);
                }
                query.bind(start as i64).execute(&mut *conn).await?;
            }
            VersionChange::Replace { start, value } => {
                let Some(col) = self.value_column else {
                    return Ok(());
                };
                let sql = format!("UPDATE {t} SET {col} = ? WHERE dataset = ?{k} AND block_start = ?");
                let mut query = sqlx::query(&sql).bind(value).bind(dataset);
                for key in self.key {
                    query = query.bind(key);
                }
                query.bind(start as i64).execute(&mut *conn).await?;
            }
            VersionChange::Open { start, value } => {
                let mut columns: Vec<&str> = vec!["dataset"];
                columns.extend(self.key_columns);
                columns.push("block_start");
                columns.extend(self.value_column);
                let marks = vec!["?"; columns.len()].join(", ");
                let sql = format!("INSERT INTO {t} ({}) VALUES ({marks})", columns.join(", "));
                let mut query = sqlx::query(&sql).bind(dataset);
                for key in self.key {
                    query = query.bind(key);
                }
                query = query.bind(start as i64);
                if self.value_column.is_some() {
                    query = query.bind(value);
                }
                query.execute(&mut *conn).await?;
            }
        }
        Ok(())
    }
}

async fn revert_table(
    conn: &mut SqliteConnection,
    table: &str,
    dataset: &str,
    block: BlockNumber,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DELETE FROM {table} WHERE dataset = ? AND block_start > ?"))
        .bind(dataset)
        .bind(block as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "UPDATE {table} SET block_end = NULL WHERE dataset = ? AND block_end > ?"
    ))
    .bind(dataset)
    .bind(block as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ─── Entity store ────────────────────────────────────────────────────────────

/// [`EntityStore`] over the `entities` table, partitioned by dataset.
pub struct SqliteEntityStore {
    pool: SqlitePool,
    part: Partition,
}

impl SqliteEntityStore {
    fn row<'a>(&self, key: &'a EntityKey) -> VersionedRow<'a> {
        VersionedRow {
            table: "entities",
            key_columns: &["entity_type", "entity_id"],
            key: [&key.entity_type, &key.entity_id],
            value_column: Some("data"),
        }
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, StoreError> {
        self.pool.acquire().await.map_err(self.part.err())
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity, StoreError> {
    let data: String = row.get("data");
    Ok(Entity {
        key: EntityKey::new(row.get::<String, _>("entity_type"), row.get::<String, _>("entity_id")),
        fields: serde_json::from_str(&data)?,
        range: range_from_row(row),
    })
}

#[async_trait]
impl BlockStore for SqliteEntityStore {
    fn name(&self) -> &str {
        self.part.store
    }

    async fn head(&self) -> Result<Option<BlockPtr>, StoreError> {
        let mut conn = self.conn().await?;
        self.part.head(&mut conn).await
    }

    async fn staged(&self) -> Result<Option<BlockPtr>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(self.part.staged(&mut conn).await?.map(|(ptr, _)| ptr))
    }

    async fn mark_committed(&self, block: &BlockPtr) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(self.part.err())?;
        let Some(payload) = self.part.take_staged(&mut tx, block).await? else {
            return Ok(());
        };
        let writes: Vec<EntityWrite> = serde_json::from_str(&payload)?;
        for write in &writes {
            let row = self.row(&write.key);
            let open = row
                .open_start(&mut tx, &self.part.dataset)
                .await
                .map_err(self.part.err())?;
            let changes = match &write.data {
                Some(fields) => plan_put(open, block.number, serde_json::to_string(fields)?),
                None => plan_drop(open, block.number),
            };
            for change in changes {
                row.apply(&mut tx, &self.part.dataset, change)
                    .await
                    .map_err(self.part.err())?;
            }
        }
        self.part.advance(&mut tx, block).await?;
        tx.commit().await.map_err(self.part.err())?;
        debug!(dataset = %self.part.dataset, block = %block, writes = writes.len(), "Entities committed");
        Ok(())
    }

    async fn discard_staged(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        self.part.clear_staged(&mut conn).await
    }

    async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(self.part.err())?;
        if !self.part.revert_to(&mut tx, block).await? {
            return Ok(());
        }
        revert_table(&mut tx, "entities", &self.part.dataset, block)
            .await
            .map_err(self.part.err())?;
        tx.commit().await.map_err(self.part.err())?;
        debug!(dataset = %self.part.dataset, block, "Entities reverted");
        Ok(())
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn stage_block(&self, block: &BlockPtr, ops: &[EntityOp]) -> Result<StageOutcome, StoreError> {
        check_ops(block.number, ops)?;
        let mut conn = self.conn().await?;
        if self.part.check(&mut conn, block).await? == StageOutcome::AlreadyCommitted {
            return Ok(StageOutcome::AlreadyCommitted);
        }

        let mut base: BTreeMap<EntityKey, Fields> = BTreeMap::new();
        for op in ops {
            let key = op.key();
            if base.contains_key(key) {
                continue;
            }
            let row = sqlx::query(
                "SELECT data FROM entities
                 WHERE dataset = ? AND entity_type = ? AND entity_id = ? AND block_end IS NULL",
            )
            .bind(&self.part.dataset)
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(self.part.err())?;
            if let Some(row) = row {
                let data: String = row.get("data");
                base.insert(key.clone(), serde_json::from_str(&data)?);
            }
        }

        let writes = collapse_ops(ops, &base)?;
        let payload = serde_json::to_string(&writes)?;
        self.part.stage(&mut conn, block, &payload).await?;
        Ok(StageOutcome::Staged)
    }

    async fn get(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query(
            "SELECT entity_type, entity_id, block_start, block_end, data FROM entities
             WHERE dataset = ? AND entity_type = ? AND entity_id = ?
               AND block_start <= ? AND (block_end IS NULL OR block_end > ?)",
        )
        .bind(&self.part.dataset)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(self.part.err())?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn find(&self, entity_type: &str, at: BlockNumber) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, block_start, block_end, data FROM entities
             WHERE dataset = ? AND entity_type = ?
               AND block_start <= ? AND (block_end IS NULL OR block_end > ?)
             ORDER BY entity_id",
        )
        .bind(&self.part.dataset)
        .bind(entity_type)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(self.part.err())?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn entity_count(&self, at: BlockNumber) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM entities
             WHERE dataset = ? AND block_start <= ? AND (block_end IS NULL OR block_end > ?)",
        )
        .bind(&self.part.dataset)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(self.part.err())?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

// ─── Graph store ─────────────────────────────────────────────────────────────

/// [`GraphStore`] over the `graph_nodes` / `graph_edges` tables.
pub struct SqliteGraphStore {
    pool: SqlitePool,
    part: Partition,
}

impl SqliteGraphStore {
    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, StoreError> {
        self.pool.acquire().await.map_err(self.part.err())
    }

    async fn schema(&self, conn: &mut SqliteConnection) -> Result<GraphSchema, StoreError> {
        let rows = sqlx::query("SELECT kind, from_label, label, to_label FROM graph_schema WHERE dataset = ?")
            .bind(&self.part.dataset)
            .fetch_all(&mut *conn)
            .await
            .map_err(self.part.err())?;
        let mut schema = GraphSchema::default();
        for row in rows {
            let label: String = row.get("label");
            if row.get::<String, _>("kind") == "node" {
                schema.node_labels.insert(label);
            } else {
                schema
                    .edge_labels
                    .insert((row.get("from_label"), label, row.get("to_label")));
            }
        }
        Ok(schema)
    }

    async fn apply(&self, conn: &mut SqliteConnection, block: BlockNumber, mutation: GraphMutation) -> Result<(), StoreError> {
        let dataset = self.part.dataset.as_str();
        match mutation {
            GraphMutation::PutNode { key, properties } => {
                let row = node_row(&key);
                let open = row.open_start(conn, dataset).await.map_err(self.part.err())?;
                for change in plan_put(open, block, serde_json::to_string(&properties)?) {
                    row.apply(conn, dataset, change).await.map_err(self.part.err())?;
                }
            }
            GraphMutation::RemoveNode { key } => {
                let row = node_row(&key);
                let open = row.open_start(conn, dataset).await.map_err(self.part.err())?;
                for change in plan_drop(open, block) {
                    row.apply(conn, dataset, change).await.map_err(self.part.err())?;
                }
            }
            GraphMutation::PutEdge { edge } => {
                if self.edge_open(conn, &edge).await?.is_none() {
                    self.insert_edge(conn, &edge, block).await?;
                }
            }
            GraphMutation::RemoveEdge { edge } => match self.edge_open(conn, &edge).await? {
                Some(start) if start == block => {
                    self.edge_query(conn, &edge, "DELETE FROM graph_edges", "AND block_start = ?", None, start)
                        .await?
                }
                Some(start) => {
                    self.edge_query(
                        conn,
                        &edge,
                        "UPDATE graph_edges SET block_end = ?",
                        "AND block_start = ?",
                        Some(block),
                        start,
                    )
                    .await?
                }
                None => {}
            },
        }
        Ok(())
    }

    async fn edge_open(&self, conn: &mut SqliteConnection, edge: &EdgeKey) -> Result<Option<BlockNumber>, StoreError> {
        let row = sqlx::query(
            "SELECT block_start FROM graph_edges
             WHERE dataset = ? AND from_label = ? AND from_id = ? AND label = ?
               AND to_label = ? AND to_id = ? AND block_end IS NULL",
        )
        .bind(&self.part.dataset)
        .bind(&edge.from.entity_type)
        .bind(&edge.from.entity_id)
        .bind(&edge.label)
        .bind(&edge.to.entity_type)
        .bind(&edge.to.entity_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(self.part.err())?;
        Ok(row.map(|r| r.get::<i64, _>("block_start") as u64))
    }

    async fn insert_edge(&self, conn: &mut SqliteConnection, edge: &EdgeKey, block: BlockNumber) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO graph_edges
             (dataset, label, from_label, from_id, to_label, to_id, block_start)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.part.dataset)
        .bind(&edge.label)
        .bind(&edge.from.entity_type)
        .bind(&edge.from.entity_id)
        .bind(&edge.to.entity_type)
        .bind(&edge.to.entity_id)
        .bind(block as i64)
        .execute(&mut *conn)
        .await
        .map_err(self.part.err())?;
        Ok(())
    }

    /// Run `head WHERE <edge key> tail`, binding `set` (if any) first and `start` last.
    async fn edge_query(
        &self,
        conn: &mut SqliteConnection,
        edge: &EdgeKey,
        head: &str,
        tail: &str,
        set: Option<BlockNumber>,
        start: BlockNumber,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "{head} WHERE dataset = ? AND from_label = ? AND from_id = ? AND label = ?
               AND to_label = ? AND to_id = ? {tail}"
        );
        let mut query = sqlx::query(&sql);
        if let Some(end) = set {
            query = query.bind(end as i64);
        }
        query
            .bind(&self.part.dataset)
            .bind(&edge.from.entity_type)
            .bind(&edge.from.entity_id)
            .bind(&edge.label)
            .bind(&edge.to.entity_type)
            .bind(&edge.to.entity_id)
            .bind(start as i64)
            .execute(&mut *conn)
            .await
            .map_err(self.part.err())?;
        Ok(())
    }
}

fn node_row(key: &EntityKey) -> VersionedRow<'_> {
    VersionedRow {
        table: "graph_nodes",
        key_columns: &["label", "node_id"],
        key: [&key.entity_type, &key.entity_id],
        value_column: Some("properties"),
    }
}

#[async_trait]
impl BlockStore for SqliteGraphStore {
    fn name(&self) -> &str {
        self.part.store
    }

    async fn head(&self) -> Result<Option<BlockPtr>, StoreError> {
        let mut conn = self.conn().await?;
        self.part.head(&mut conn).await
    }

    async fn staged(&self) -> Result<Option<BlockPtr>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(self.part.staged(&mut conn).await?.map(|(ptr, _)| ptr))
    }

    async fn mark_committed(&self, block: &BlockPtr) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(self.part.err())?;
        let Some(payload) = self.part.take_staged(&mut tx, block).await? else {
            return Ok(());
        };
        let mutations: Vec<GraphMutation> = serde_json::from_str(&payload)?;
        let count = mutations.len();
        for mutation in mutations {
            self.apply(&mut tx, block.number, mutation).await?;
        }
        self.part.advance(&mut tx, block).await?;
        tx.commit().await.map_err(self.part.err())?;
        debug!(dataset = %self.part.dataset, block = %block, mutations = count, "Graph committed");
        Ok(())
    }

    async fn discard_staged(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        self.part.clear_staged(&mut conn).await
    }

    async fn revert_to(&self, block: BlockNumber) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(self.part.err())?;
        if !self.part.revert_to(&mut tx, block).await? {
            return Ok(());
        }
        for table in ["graph_nodes", "graph_edges"] {
            revert_table(&mut tx, table, &self.part.dataset, block)
                .await
                .map_err(self.part.err())?;
        }
        tx.commit().await.map_err(self.part.err())?;
        debug!(dataset = %self.part.dataset, block, "Graph reverted");
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn ensure_schema(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let schema = GraphSchema::from_manifest(manifest);
        let mut tx = self.pool.begin().await.map_err(self.part.err())?;
        let nodes = schema.node_labels.iter().map(|l| ("node", "", l.as_str(), ""));
        let edges = schema
            .edge_labels
            .iter()
            .map(|(f, l, t)| ("edge", f.as_str(), l.as_str(), t.as_str()));
        for (kind, from, label, to) in nodes.chain(edges) {
            sqlx::query(
                "INSERT OR IGNORE INTO graph_schema (dataset, kind, from_label, label, to_label)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&self.part.dataset)
            .bind(kind)
            .bind(from)
            .bind(label)
            .bind(to)
            .execute(&mut *tx)
            .await
            .map_err(self.part.err())?;
        }
        tx.commit().await.map_err(self.part.err())?;
        Ok(())
    }

    async fn stage_block(
        &self,
        block: &BlockPtr,
        mutations: &[GraphMutation],
    ) -> Result<StageOutcome, StoreError> {
        let mut conn = self.conn().await?;
        let schema = self.schema(&mut conn).await?;
        for m in mutations {
            schema.check(m)?;
        }
        if self.part.check(&mut conn, block).await? == StageOutcome::AlreadyCommitted {
            return Ok(StageOutcome::AlreadyCommitted);
        }
        let payload = serde_json::to_string(mutations)?;
        self.part.stage(&mut conn, block, &payload).await?;
        Ok(StageOutcome::Staged)
    }

    async fn node(&self, key: &EntityKey, at: BlockNumber) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query(
            "SELECT block_start, block_end, properties FROM graph_nodes
             WHERE dataset = ? AND label = ? AND node_id = ?
               AND block_start <= ? AND (block_end IS NULL OR block_end > ?)",
        )
        .bind(&self.part.dataset)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(self.part.err())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let properties: String = row.get("properties");
        Ok(Some(Node {
            key: key.clone(),
            properties: serde_json::from_str(&properties)?,
            range: range_from_row(&row),
        }))
    }

    async fn edges_from(&self, key: &EntityKey, at: BlockNumber) -> Result<Vec<Edge>, StoreError> {
        let rows = sqlx::query(
            "SELECT label, to_label, to_id, block_start, block_end FROM graph_edges
             WHERE dataset = ? AND from_label = ? AND from_id = ?
               AND block_start <= ? AND (block_end IS NULL OR block_end > ?)
             ORDER BY label, to_label, to_id",
        )
        .bind(&self.part.dataset)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(self.part.err())?;
        Ok(rows
            .iter()
            .map(|r| Edge {
                key: EdgeKey::new(
                    r.get::<String, _>("label"),
                    key.clone(),
                    EntityKey::new(r.get::<String, _>("to_label"), r.get::<String, _>("to_id")),
                ),
                range: range_from_row(r),
            })
            .collect())
    }

    async fn node_count(&self, at: BlockNumber) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM graph_nodes
             WHERE dataset = ? AND block_start <= ? AND (block_end IS NULL OR block_end > ?)",
        )
        .bind(&self.part.dataset)
        .bind(at as i64)
        .bind(at as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(self.part.err())?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

fn checkpoint_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Store(sqlx_error("checkpoints", e))
}

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT dataset, cursor, fatal_error, updated_at FROM checkpoints WHERE dataset = ?",
        )
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let cursor = row
            .get::<Option<String>, _>("cursor")
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)?;
        Ok(Some(Checkpoint {
            dataset: row.get("dataset"),
            cursor,
            fatal_error: row.get("fatal_error"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let cursor = checkpoint
            .cursor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::from)?;
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (dataset, cursor, fatal_error, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.dataset)
        .bind(cursor)
        .bind(&checkpoint.fatal_error)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(checkpoint_err)?;

        debug!(
            dataset = %checkpoint.dataset,
            block = ?checkpoint.block_number(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, dataset: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE dataset = ?")
            .bind(dataset)
            .execute(&self.pool)
            .await
            .map_err(checkpoint_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use blockgraph_core::commit::BlockCommitter;
    use blockgraph_core::cursor::Cursor;
    use blockgraph_core::entity::fields;
    use blockgraph_core::types::Block;
    use serde_json::json;
    use std::sync::Arc;

    fn ptr(n: u64) -> BlockPtr {
        BlockPtr::new(n, format!("0x{n:x}"))
    }

    fn e1() -> EntityKey {
        EntityKey::new("Account", "e1")
    }

    fn manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "name": "tokens",
                "data_sources": [{ "name": "Token" }],
                "entities": [
                    { "name": "Account" },
                    { "name": "Token", "fields": [{ "name": "owner", "type": "ID", "references": "Account" }] }
                ]
            }"#,
        )
        .unwrap()
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let block = Block::new(1_000, "0xabcdef", "0xabcdee", 1_700_000_000);
        let cp = Checkpoint {
            dataset: "tokens".into(),
            cursor: Some(Cursor {
                last_processed_block: block.clone(),
                segment: vec![block],
            }),
            fatal_error: None,
            updated_at: 1_700_000_000,
        };
        storage.save(cp.clone()).await.unwrap();
        assert_eq!(storage.load("tokens").await.unwrap(), Some(cp));
        assert!(storage.load("unknown").await.unwrap().is_none());

        storage.delete("tokens").await.unwrap();
        assert!(storage.load("tokens").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_failure_without_cursor() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let cp = Checkpoint {
            dataset: "tokens".into(),
            cursor: None,
            fatal_error: Some("bad manifest".into()),
            updated_at: 0,
        };
        storage.save(cp.clone()).await.unwrap();
        assert_eq!(storage.load("tokens").await.unwrap(), Some(cp));
        assert_eq!(storage.datasets().await.unwrap(), vec!["tokens".to_string()]);
    }

    // ── Entity store ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn entity_visible_between_create_and_remove() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let store = storage.entity_store("ds");
        for n in 1..=8 {
            let ops = match n {
                3 => vec![EntityOp::create(3, e1(), fields([("balance", 1)]))],
                7 => vec![EntityOp::remove(7, e1())],
                _ => vec![],
            };
            store.commit_block(&ptr(n), &ops).await.unwrap();
        }
        for at in 0..=8 {
            let visible = store.get(&e1(), at).await.unwrap().is_some();
            assert_eq!(visible, (3..7).contains(&at), "at block {at}");
        }
        let e = store.get(&e1(), 5).await.unwrap().unwrap();
        assert_eq!(e.range, BlockRange { start: 3, end: Some(7) });
        assert_eq!(e.fields["id"], json!("e1"));
    }

    #[tokio::test]
    async fn entity_updates_and_collapse() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let store = storage.entity_store("ds");
        store
            .commit_block(
                &ptr(1),
                &[
                    EntityOp::create(1, e1(), fields([("balance", json!(1)), ("name", json!("a"))])),
                    EntityOp::update(1, e1(), fields([("balance", 2)])),
                ],
            )
            .await
            .unwrap();
        store
            .commit_block(&ptr(2), &[EntityOp::update(2, e1(), fields([("balance", 3)]))])
            .await
            .unwrap();

        assert_eq!(store.get(&e1(), 1).await.unwrap().unwrap().fields["balance"], json!(2));
        let current = store.get(&e1(), 2).await.unwrap().unwrap();
        assert_eq!(current.fields["balance"], json!(3));
        assert_eq!(current.fields["name"], json!("a"));
        assert_eq!(store.find("Account", 2).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_at_committed_block_ignore_concurrent_commits() {
        // Later blocks close the version's range, so compare contents only.
        fn keys(found: Vec<Entity>) -> Vec<(EntityKey, Fields)> {
            found.into_iter().map(|e| (e.key, e.fields)).collect()
        }

        let storage = SqliteStorage::in_memory().await.unwrap();
        let store = Arc::new(storage.entity_store("ds"));
        store
            .commit_block(&ptr(1), &[EntityOp::create(1, e1(), fields([("balance", 1)]))])
            .await
            .unwrap();
        store
            .commit_block(&ptr(2), &[EntityOp::update(2, e1(), fields([("balance", 2)]))])
            .await
            .unwrap();
        let entity = store.get(&e1(), 2).await.unwrap().map(|e| e.fields);
        let accounts = keys(store.find("Account", 2).await.unwrap());

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for n in 3..=60u64 {
                    let ops = vec![
                        EntityOp::update(n, e1(), fields([("balance", n)])),
                        EntityOp::create(n, EntityKey::new("Account", format!("a{n}")), fields([("balance", 0)])),
                    ];
                    store.commit_block(&ptr(n), &ops).await.unwrap();
                }
            })
        };

        loop {
            assert_eq!(store.get(&e1(), 2).await.unwrap().map(|e| e.fields), entity);
            assert_eq!(keys(store.find("Account", 2).await.unwrap()), accounts);
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();

        assert_eq!(store.get(&e1(), 2).await.unwrap().map(|e| e.fields), entity);
        assert_eq!(store.find("Account", 60).await.unwrap().len(), 59);
    }

    #[tokio::test]
    async fn commit_idempotence_and_conflicts() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let store = storage.entity_store("ds");
        let ops = vec![EntityOp::create(1, e1(), Fields::new())];
        assert_eq!(store.commit_block(&ptr(1), &ops).await.unwrap(), StageOutcome::Staged);
        assert_eq!(
            store.commit_block(&ptr(1), &ops).await.unwrap(),
            StageOutcome::AlreadyCommitted
        );
        assert_eq!(store.entity_count(1).await.unwrap(), 1);

        assert!(matches!(
            store.commit_block(&BlockPtr::new(1, "0xother"), &[]).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            store.commit_block(&ptr(4), &[]).await,
            Err(StoreError::NonSequential { expected: 2, got: 4 })
        ));
        let dup = vec![EntityOp::create(2, e1(), Fields::new())];
        assert!(matches!(
            store.commit_block(&ptr(2), &dup).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn revert_restores_previous_state() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let store = storage.entity_store("ds");
        store
            .commit_block(&ptr(1), &[EntityOp::create(1, e1(), fields([("balance", 1)]))])
            .await
            .unwrap();
        let before = store.get(&e1(), 1).await.unwrap();

        store
            .commit_block(&ptr(2), &[EntityOp::update(2, e1(), fields([("balance", 2)]))])
            .await
            .unwrap();
        store.commit_block(&ptr(3), &[EntityOp::remove(3, e1())]).await.unwrap();

        store.revert_to(1).await.unwrap();
        assert_eq!(store.head().await.unwrap(), Some(ptr(1)));
        assert_eq!(store.get(&e1(), 1).await.unwrap(), before);
        assert!(store.get(&e1(), 9).await.unwrap().is_some());

        // Replaying another branch works from the reverted head.
        let b2 = BlockPtr::new(2, "0x2b");
        store.commit_block(&b2, &[]).await.unwrap();
        assert_eq!(store.head().await.unwrap(), Some(b2));
    }

    #[tokio::test]
    async fn datasets_are_isolated() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let a = storage.entity_store("a");
        let b = storage.entity_store("b");
        a.commit_block(&ptr(10), &[EntityOp::create(10, e1(), Fields::new())])
            .await
            .unwrap();
        b.commit_block(&ptr(1), &[]).await.unwrap();

        assert_eq!(b.entity_count(100).await.unwrap(), 0);
        assert_eq!(b.head().await.unwrap(), Some(ptr(1)));

        storage.drop_dataset("a").await.unwrap();
        assert_eq!(a.head().await.unwrap(), None);
        assert_eq!(b.head().await.unwrap(), Some(ptr(1)));
    }

    // ── Graph store ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn graph_rejects_unknown_labels() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let graph = storage.graph_store("ds");
        graph.ensure_schema(&manifest()).await.unwrap();
        graph.ensure_schema(&manifest()).await.unwrap();

        let bad = vec![GraphMutation::PutNode {
            key: EntityKey::new("Pool", "p1"),
            properties: Fields::new(),
        }];
        assert!(matches!(
            graph.stage_block(&ptr(1), &bad).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn committer_over_sqlite() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let entities = Arc::new(storage.entity_store("ds"));
        let graph = Arc::new(storage.graph_store("ds"));
        graph.ensure_schema(&manifest()).await.unwrap();
        let committer = BlockCommitter::new(entities.clone(), graph.clone(), &manifest());

        let t1 = EntityKey::new("Token", "t1");
        for n in 1..=3 {
            let ops = vec![EntityOp::update(n, t1.clone(), fields([("owner", format!("a{n}"))]))];
            committer.commit(&ptr(n), &ops).await.unwrap();
        }
        assert_eq!(committer.heads().await.unwrap(), (Some(ptr(3)), Some(ptr(3))));

        let edges = graph.edges_from(&t1, 2).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key.to, EntityKey::new("Account", "a2"));
        assert_eq!(edges[0].range, BlockRange { start: 2, end: Some(3) });

        committer.revert_to(1).await.unwrap();
        assert_eq!(graph.edges_from(&t1, 5).await.unwrap()[0].key.to.entity_id, "a1");
        assert_eq!(graph.node_count(5).await.unwrap(), 1);
        assert_eq!(entities.head().await.unwrap(), Some(ptr(1)));
    }

    #[tokio::test]
    async fn recovery_completes_staged_graph() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let entities = Arc::new(storage.entity_store("ds"));
        let graph = Arc::new(storage.graph_store("ds"));
        graph.ensure_schema(&manifest()).await.unwrap();
        let committer = BlockCommitter::new(entities.clone(), graph.clone(), &manifest());

        let t1 = EntityKey::new("Token", "t1");
        let ops = vec![EntityOp::create(1, t1.clone(), fields([("owner", "a1")]))];
        committer.commit(&ptr(1), &ops).await.unwrap();

        // Simulate a crash after the entity mark: graph staged, not marked.
        let ops = vec![EntityOp::update(2, t1.clone(), fields([("owner", "a2")]))];
        entities.commit_block(&ptr(2), &ops).await.unwrap();
        let mutations = vec![
            GraphMutation::PutNode {
                key: t1.clone(),
                properties: fields([("id", "t1"), ("owner", "a2")]),
            },
        ];
        graph.stage_block(&ptr(2), &mutations).await.unwrap();

        assert_eq!(committer.recover().await.unwrap(), Some(ptr(2)));
        assert_eq!(graph.staged().await.unwrap(), None);
        assert_eq!(graph.node(&t1, 2).await.unwrap().unwrap().properties["owner"], json!("a2"));
    }
}
