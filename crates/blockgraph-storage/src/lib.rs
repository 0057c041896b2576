//! blockgraph-storage: pluggable entity, graph and checkpoint backends.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx` (entities and checkpoints)

#[cfg(feature = "memory")]
pub mod memory {
    //! In-memory stores, re-exported from `blockgraph-core`.
    pub use blockgraph_core::checkpoint::MemoryCheckpointStore;
    pub use blockgraph_core::memory::{InMemoryEntityStore, InMemoryGraphStore};
}

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::{InMemoryEntityStore, InMemoryGraphStore, MemoryCheckpointStore};

/// Classify a `sqlx` failure: connection-level and lock errors are retryable.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn sqlx_error(store: &str, e: sqlx::Error) -> blockgraph_core::error::StoreError {
    use blockgraph_core::error::StoreError;

    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::transient(store, e)
        }
        sqlx::Error::Database(db) if is_lock_error(db.message()) => StoreError::transient(store, e),
        _ => StoreError::backend(store, e),
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn is_lock_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked")
        || message.contains("busy")
        || message.contains("deadlock detected")
        || message.contains("could not serialize")
}
