//! `PostgreSQL` [`MappingStore`] implementation (feature `postgres`).
//!
//! Table names come from [`TableRef::name`] and the configured prefix, which
//! `MappingConfig::validate` restricts to `[A-Za-z0-9_]`, so they are safe to
//! splice into statements. Every value is bound.

use std::collections::BTreeMap;

use async_trait::async_trait;
use idmap_core::{TableKind, TableRef};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::storage::mapping_store::{IdRow, MappingStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Sharded association tables in `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PostgresMappingStore {
    pool: PgPool,
    prefix: String,
}

impl PostgresMappingStore {
    #[must_use]
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    /// Opens a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool, prefix))
    }

    fn name(&self, table: TableRef) -> String {
        table.name(&self.prefix)
    }

    /// Index column of `kind`'s table family.
    fn key_column(kind: TableKind) -> &'static str {
        match kind {
            TableKind::FromIndexed => "from_id",
            TableKind::ToIndexed => "to_id",
        }
    }

    async fn select_one(
        &self,
        table: TableRef,
        by: &str,
        wanted: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let sql = format!("SELECT {wanted} FROM {} WHERE {by} = $1 LIMIT 1", self.name(table));
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;
        row.map(|r| r.try_get::<String, _>(0))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn delete_in(
        &self,
        table: TableRef,
        column: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE {column} = ANY($1)", self.name(table));
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MappingStore for PostgresMappingStore {
    async fn table_exists(&self, table: TableRef) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(self.name(table))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_table(&self, table: TableRef) -> Result<(), StoreError> {
        let key = Self::key_column(table.kind);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             from_id VARCHAR(128) NOT NULL, \
             to_id VARCHAR(128) NOT NULL, \
             PRIMARY KEY ({key}))",
            self.name(table)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn select_to_id(
        &self,
        table: TableRef,
        from_id: &str,
    ) -> Result<Option<String>, StoreError> {
        self.select_one(table, "from_id", "to_id", from_id).await
    }

    async fn select_from_id(
        &self,
        table: TableRef,
        to_id: &str,
    ) -> Result<Option<String>, StoreError> {
        self.select_one(table, "to_id", "from_id", to_id).await
    }

    async fn insert_batch(&self, table: TableRef, rows: &[IdRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let key = Self::key_column(table.kind);
        let other = match table.kind {
            TableKind::FromIndexed => "to_id",
            TableKind::ToIndexed => "from_id",
        };
        let sql = format!(
            "INSERT INTO {} (from_id, to_id) \
             SELECT * FROM UNNEST($1::VARCHAR[], $2::VARCHAR[]) \
             ON CONFLICT ({key}) DO UPDATE SET {other} = EXCLUDED.{other}",
            self.name(table)
        );
        // One statement may not touch the same conflict key twice; last row wins.
        let deduped: BTreeMap<&str, &IdRow> =
            rows.iter().map(|r| (r.key_for(table.kind), r)).collect();
        let (from_ids, to_ids): (Vec<String>, Vec<String>) = deduped
            .values()
            .map(|r| (r.from_id.clone(), r.to_id.clone()))
            .unzip();
        let result = sqlx::query(&sql)
            .bind(from_ids)
            .bind(to_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_from_ids(
        &self,
        table: TableRef,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        self.delete_in(table, "from_id", ids).await
    }

    async fn delete_by_to_ids(&self, table: TableRef, ids: &[String]) -> Result<u64, StoreError> {
        self.delete_in(table, "to_id", ids).await
    }

    async fn delete_expired(
        &self,
        table: TableRef,
        boundary: &str,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let name = self.name(table);
        let sql = format!(
            "DELETE FROM {name} WHERE ctid IN \
             (SELECT ctid FROM {name} WHERE from_id <= $1 LIMIT $2)"
        );
        let result = sqlx::query(&sql)
            .bind(boundary)
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
