//! In-process [`MappingStore`] implementation.
//!
//! [`MemoryMappingStore`] keeps every table in a [`DashMap`] keyed by the
//! physical table name. It is the default backend when no database is
//! configured and the backend the engine tests run against; it can be told
//! to fail or stall writes for specific tables.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use idmap_core::{TableKind, TableRef};
use parking_lot::Mutex;

use crate::storage::mapping_store::{IdRow, MappingStore, StoreError};

/// Rows of one table keyed by the table's index column.
type Table = BTreeMap<String, IdRow>;

/// Sharded association tables held in memory.
#[derive(Debug)]
pub struct MemoryMappingStore {
    prefix: String,
    tables: DashMap<String, Table>,
    failing: DashSet<String>,
    write_delay: Mutex<Option<Duration>>,
    insert_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl Default for MemoryMappingStore {
    fn default() -> Self {
        Self::with_prefix("id_mapping_")
    }
}

impl MemoryMappingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tables: DashMap::new(),
            failing: DashSet::new(),
            write_delay: Mutex::new(None),
            insert_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    /// Makes every write to `table` fail until [`heal`](Self::heal) is called.
    pub fn fail_writes_to(&self, table: TableRef) {
        self.failing.insert(table.name(&self.prefix));
    }

    pub fn heal(&self) {
        self.failing.clear();
    }

    /// Delays every batched insert and delete by `delay`.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Number of rows currently stored in `table`.
    #[must_use]
    pub fn row_count(&self, table: TableRef) -> usize {
        self.tables
            .get(&table.name(&self.prefix))
            .map_or(0, |t| t.len())
    }

    /// Total rows across every table.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    #[must_use]
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    async fn before_write(&self, name: &str) -> Result<(), StoreError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(name) {
            return Err(StoreError::Unavailable(format!("writes to {name} are failing")));
        }
        Ok(())
    }

    fn with_table<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Table) -> R,
    ) -> Result<R, StoreError> {
        let mut table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingTable(name.to_string()))?;
        Ok(f(table.value_mut()))
    }

    fn delete_where(
        &self,
        table: TableRef,
        mut matches: impl FnMut(&IdRow) -> bool,
        limit: usize,
    ) -> Result<u64, StoreError> {
        self.with_table(&table.name(&self.prefix), |rows| {
            let doomed: Vec<String> = rows
                .iter()
                .filter(|(_, row)| matches(*row))
                .take(limit)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                rows.remove(key);
            }
            doomed.len() as u64
        })
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn table_exists(&self, table: TableRef) -> Result<bool, StoreError> {
        Ok(self.tables.contains_key(&table.name(&self.prefix)))
    }

    async fn create_table(&self, table: TableRef) -> Result<(), StoreError> {
        self.tables.entry(table.name(&self.prefix)).or_default();
        Ok(())
    }

    async fn select_to_id(
        &self,
        table: TableRef,
        from_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let name = table.name(&self.prefix);
        self.with_table(&name, |rows| match table.kind {
            TableKind::FromIndexed => rows.get(from_id).map(|r| r.to_id.clone()),
            TableKind::ToIndexed => rows
                .values()
                .find(|r| r.from_id == from_id)
                .map(|r| r.to_id.clone()),
        })
    }

    async fn select_from_id(
        &self,
        table: TableRef,
        to_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let name = table.name(&self.prefix);
        self.with_table(&name, |rows| match table.kind {
            TableKind::ToIndexed => rows.get(to_id).map(|r| r.from_id.clone()),
            TableKind::FromIndexed => rows
                .values()
                .find(|r| r.to_id == to_id)
                .map(|r| r.from_id.clone()),
        })
    }

    async fn insert_batch(&self, table: TableRef, rows: &[IdRow]) -> Result<u64, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::Relaxed);
        let name = table.name(&self.prefix);
        self.before_write(&name).await?;
        self.with_table(&name, |stored| {
            for row in rows {
                stored.insert(row.key_for(table.kind).to_string(), row.clone());
            }
            rows.len() as u64
        })
    }

    async fn delete_by_from_ids(
        &self,
        table: TableRef,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.before_write(&table.name(&self.prefix)).await?;
        self.delete_where(table, |row| ids.contains(&row.from_id), usize::MAX)
    }

    async fn delete_by_to_ids(&self, table: TableRef, ids: &[String]) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.before_write(&table.name(&self.prefix)).await?;
        self.delete_where(table, |row| ids.contains(&row.to_id), usize::MAX)
    }

    async fn delete_expired(
        &self,
        table: TableRef,
        boundary: &str,
        limit: u32,
    ) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.before_write(&table.name(&self.prefix)).await?;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        self.delete_where(table, |row| row.from_id.as_str() <= boundary, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_table(shard: u32) -> TableRef {
        TableRef::new(TableKind::FromIndexed, shard)
    }

    fn to_table(shard: u32) -> TableRef {
        TableRef::new(TableKind::ToIndexed, shard)
    }

    async fn store_with_tables() -> MemoryMappingStore {
        let store = MemoryMappingStore::new();
        store.create_table(from_table(0)).await.unwrap();
        store.create_table(to_table(0)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_select_both_families() {
        let store = store_with_tables().await;
        let rows = vec![IdRow::new("u1", "v1"), IdRow::new("u2", "v2")];
        assert_eq!(store.insert_batch(from_table(0), &rows).await.unwrap(), 2);
        assert_eq!(store.insert_batch(to_table(0), &rows).await.unwrap(), 2);

        assert_eq!(
            store.select_to_id(from_table(0), "u1").await.unwrap().as_deref(),
            Some("v1")
        );
        assert_eq!(
            store.select_from_id(to_table(0), "v2").await.unwrap().as_deref(),
            Some("u2")
        );
        assert!(store.select_to_id(from_table(0), "zz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_upserts_on_index_column() {
        let store = store_with_tables().await;
        store
            .insert_batch(from_table(0), &[IdRow::new("u1", "v1")])
            .await
            .unwrap();
        store
            .insert_batch(from_table(0), &[IdRow::new("u1", "v2")])
            .await
            .unwrap();
        assert_eq!(store.row_count(from_table(0)), 1);
        assert_eq!(
            store.select_to_id(from_table(0), "u1").await.unwrap().as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let store = MemoryMappingStore::new();
        let err = store
            .insert_batch(from_table(9), &[IdRow::new("a", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingTable(name) if name == "id_mapping_f9"));
    }

    #[tokio::test]
    async fn delete_by_key_lists() {
        let store = store_with_tables().await;
        let rows = vec![IdRow::new("u1", "v1"), IdRow::new("u2", "v2")];
        store.insert_batch(from_table(0), &rows).await.unwrap();
        store.insert_batch(to_table(0), &rows).await.unwrap();

        let deleted = store
            .delete_by_from_ids(from_table(0), &["u1".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let deleted = store
            .delete_by_to_ids(to_table(0), &["v2".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.total_rows(), 2);
    }

    #[tokio::test]
    async fn delete_expired_is_bounded() {
        let store = store_with_tables().await;
        let rows: Vec<IdRow> = (0..5)
            .map(|i| IdRow::new(format!("2020010100000000{i}"), format!("v{i}")))
            .chain(std::iter::once(IdRow::new("20300101000000000", "fresh")))
            .collect();
        store.insert_batch(to_table(0), &rows).await.unwrap();

        let boundary = "20250101000000000";
        assert_eq!(store.delete_expired(to_table(0), boundary, 3).await.unwrap(), 3);
        assert_eq!(store.delete_expired(to_table(0), boundary, 3).await.unwrap(), 2);
        assert_eq!(store.delete_expired(to_table(0), boundary, 3).await.unwrap(), 0);
        assert_eq!(store.row_count(to_table(0)), 1);
    }

    #[tokio::test]
    async fn injected_failures_and_heal() {
        let store = store_with_tables().await;
        store.fail_writes_to(from_table(0));
        assert!(matches!(
            store.insert_batch(from_table(0), &[IdRow::new("a", "b")]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store
            .insert_batch(to_table(0), &[IdRow::new("a", "b")])
            .await
            .is_ok());
        store.heal();
        assert!(store
            .insert_batch(from_table(0), &[IdRow::new("a", "b")])
            .await
            .is_ok());
        assert_eq!(store.insert_calls(), 3);
    }
}
