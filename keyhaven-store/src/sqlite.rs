// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistent storage.
//!
//! All entries live in one `kv_v1` table with `BLOB` keys. SQLite compares blobs with `memcmp`,
//! range queries therefore follow the same lexicographic byte order as the in-memory store.
use std::ops::Bound;

use sqlx::migrate::{MigrateDatabase, MigrateError};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, migrate, query, query_as, query_scalar};
use thiserror::Error;
use tracing::{debug, trace};

use crate::traits::{BatchOperation, Entry, KeyRange, KeyValueStore};

/// Re-export of SQLite connection pool type.
pub type Pool = SqlitePool;

/// SQLite-based persistent store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pub(crate) pool: Pool,
}

impl SqliteStore {
    /// Create a new `SqliteStore` using the provided db `Pool`.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Create the database if it doesn't already exist.
pub async fn create_database(url: &str) -> Result<(), SqliteStoreError> {
    if !Sqlite::database_exists(url).await? {
        debug!(url, "create sqlite database");
        Sqlite::create_database(url).await?;
    }

    Ok(())
}

/// Create a connection pool.
pub async fn connection_pool(url: &str, max_connections: u32) -> Result<Pool, SqliteStoreError> {
    let pool: Pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    Ok(pool)
}

/// Run any pending database migrations from inside the application.
pub async fn run_pending_migrations(pool: &Pool) -> Result<(), SqliteStoreError> {
    migrate!().run(pool).await?;
    Ok(())
}

/// `WHERE` clause and its bound parameters for a key range.
fn range_clause(range: &KeyRange) -> (String, Vec<Vec<u8>>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    match &range.start {
        Bound::Included(key) => {
            conditions.push("key >= ?");
            params.push(key.clone());
        }
        Bound::Excluded(key) => {
            conditions.push("key > ?");
            params.push(key.clone());
        }
        Bound::Unbounded => (),
    }

    match &range.end {
        Bound::Included(key) => {
            conditions.push("key <= ?");
            params.push(key.clone());
        }
        Bound::Excluded(key) => {
            conditions.push("key < ?");
            params.push(key.clone());
        }
        Bound::Unbounded => (),
    }

    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), params)
    }
}

impl KeyValueStore for SqliteStore {
    type Error = SqliteStoreError;

    type Entries = std::vec::IntoIter<Result<Entry, SqliteStoreError>>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        let value = query_scalar::<_, Vec<u8>>("SELECT value FROM kv_v1 WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Self::Error> {
        query(
            "
            INSERT INTO kv_v1 (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> Result<(), Self::Error> {
        query("DELETE FROM kv_v1 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<(), Self::Error> {
        // Any statement after this point, and before `commit()`, is rolled back when the
        // transaction is dropped on error.
        let mut tx = self.pool.begin().await?;

        trace!(operations = operations.len(), "apply batch");
        for operation in operations {
            match operation {
                BatchOperation::Put { key, value } => {
                    query(
                        "
                        INSERT INTO kv_v1 (key, value)
                        VALUES (?, ?)
                        ON CONFLICT(key) DO UPDATE SET value = excluded.value
                        ",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                BatchOperation::Del { key } => {
                    query("DELETE FROM kv_v1 WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self, range: &KeyRange) -> Result<(), Self::Error> {
        if range.is_empty() {
            return Ok(());
        }

        let (clause, params) = range_clause(range);
        let sql = format!("DELETE FROM kv_v1 {clause}");
        let mut statement = query(&sql);
        for param in params {
            statement = statement.bind(param);
        }
        let result = statement.execute(&self.pool).await?;
        trace!(keys = result.rows_affected(), "clear range");
        Ok(())
    }

    async fn iter(&self, range: &KeyRange) -> Result<Self::Entries, Self::Error> {
        if range.is_empty() {
            return Ok(Vec::new().into_iter());
        }

        let (clause, params) = range_clause(range);
        let order = if range.reverse { "DESC" } else { "ASC" };
        let limit = match range.limit {
            Some(limit) => format!("LIMIT {limit}"),
            None => String::new(),
        };
        let sql = format!("SELECT key, value FROM kv_v1 {clause} ORDER BY key {order} {limit}");

        let mut statement = query_as::<_, (Vec<u8>, Vec<u8>)>(&sql);
        for param in params {
            statement = statement.bind(param);
        }
        let rows = statement.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("an error occurred with the sqlite database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed running database migrations: {0}")]
    Migration(#[from] MigrateError),
}
