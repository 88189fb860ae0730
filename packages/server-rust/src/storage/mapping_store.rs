//! Persistent-store contract for sharded association tables.
//!
//! Each shard has a from-indexed table (`prefix + "f" + i`) and a to-indexed
//! table (`prefix + "t" + i`). Both hold `(from_id, to_id)` rows. The store
//! resolves a [`TableRef`] to a physical name with its own prefix, so callers
//! never format table names.

use async_trait::async_trait;
use idmap_core::{TableKind, TableRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// One stored association row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRow {
    pub from_id: String,
    pub to_id: String,
}

impl IdRow {
    #[must_use]
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
        }
    }

    /// The column value that addresses this row in `kind`'s table family.
    #[must_use]
    pub fn key_for(&self, kind: TableKind) -> &str {
        match kind {
            TableKind::FromIndexed => &self.from_id,
            TableKind::ToIndexed => &self.to_id,
        }
    }
}

/// Errors returned by [`MappingStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Keyed insert/select/delete operations against the sharded tables.
///
/// Used as `Arc<dyn MappingStore>`. Implementations marshal [`IdRow`]s
/// explicitly; there is no reflection-based mapping.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Whether the physical table for `table` exists.
    async fn table_exists(&self, table: TableRef) -> Result<bool, StoreError>;

    /// Creates the physical table for `table` if it does not exist.
    async fn create_table(&self, table: TableRef) -> Result<(), StoreError>;

    /// Looks up the `to_id` stored for `from_id`.
    async fn select_to_id(&self, table: TableRef, from_id: &str)
        -> Result<Option<String>, StoreError>;

    /// Looks up the `from_id` stored for `to_id`.
    async fn select_from_id(&self, table: TableRef, to_id: &str)
        -> Result<Option<String>, StoreError>;

    /// Upserts `rows`, returning the number written.
    async fn insert_batch(&self, table: TableRef, rows: &[IdRow]) -> Result<u64, StoreError>;

    /// Deletes every row whose `from_id` is in `ids`.
    async fn delete_by_from_ids(&self, table: TableRef, ids: &[String])
        -> Result<u64, StoreError>;

    /// Deletes every row whose `to_id` is in `ids`.
    async fn delete_by_to_ids(&self, table: TableRef, ids: &[String]) -> Result<u64, StoreError>;

    /// Deletes at most `limit` rows whose `from_id` sorts at or below
    /// `boundary`, returning the number deleted.
    async fn delete_expired(
        &self,
        table: TableRef,
        boundary: &str,
        limit: u32,
    ) -> Result<u64, StoreError>;
}

/// Creates any missing table of either family for shards `0..hash_mod`.
///
/// Returns how many tables were created.
///
/// # Errors
///
/// Stops at and returns the first store error.
pub async fn ensure_tables(store: &dyn MappingStore, hash_mod: u32) -> Result<usize, StoreError> {
    let mut created = 0;
    for shard in 0..hash_mod {
        for kind in TableKind::ALL {
            let table = TableRef::new(kind, shard);
            if !store.table_exists(table).await? {
                store.create_table(table).await?;
                created += 1;
            }
        }
    }
    if created > 0 {
        info!(created, hash_mod, "created missing mapping tables");
    }
    Ok(created)
}
