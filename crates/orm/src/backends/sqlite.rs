//! SQLite Backend Implementation
//!
//! SQLite implementation of the backend traits on top of sqlx. SQLite stores
//! values with dynamic types, so rows are decoded from the storage class each
//! value actually carries rather than the declared column type.

use std::sync::Arc;
use async_trait::async_trait;
use sqlx::{Pool, Sqlite, Row as SqlxRow, sqlite::SqlitePoolOptions, Column};
use crate::error::{OrmResult, OrmError};
use super::core::*;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// SQLite database backend implementation
#[derive(Debug)]
pub struct SqliteBackend;

impl SqliteBackend {
    /// Create a new SQLite backend instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn create_pool(&self, database_url: &str, config: DatabasePoolConfig) -> OrmResult<Arc<dyn DatabasePool>> {
        let options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire)
            .idle_timeout(config.idle_timeout_seconds.map(std::time::Duration::from_secs))
            .max_lifetime(config.max_lifetime_seconds.map(std::time::Duration::from_secs));

        let sqlx_pool = options.connect(database_url)
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to create SQLite pool: {}", e)))?;

        Ok(Arc::new(SqlitePool::new(Arc::new(sqlx_pool))))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    fn backend_type(&self) -> crate::backends::DatabaseBackendType {
        crate::backends::DatabaseBackendType::SQLite
    }

    fn validate_database_url(&self, url: &str) -> OrmResult<()> {
        if !url.starts_with("sqlite:") && !url.starts_with("file:") {
            return Err(OrmError::Connection("Invalid SQLite URL scheme".to_string()));
        }
        Ok(())
    }
}

/// SQLite connection pool implementation
pub struct SqlitePool {
    pool: Arc<Pool<Sqlite>>,
}

impl SqlitePool {
    pub fn new(pool: Arc<Pool<Sqlite>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for SqlitePool {
    async fn begin_transaction(&self) -> OrmResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin()
            .await
            .map_err(|e| OrmError::Transaction(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(SqliteTransaction::new(tx)))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let result = build_query(sql, params)?
            .execute(&*self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = build_query(sql, params)?
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows.into_iter().map(|row| Box::new(SqliteRow::new(row)) as Box<dyn DatabaseRow>).collect())
    }

    async fn fetch_optional(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>> {
        let row = build_query(sql, params)?
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(SqliteRow::new(r)) as Box<dyn DatabaseRow>))
    }

    async fn close(&self) -> OrmResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// SQLite transaction implementation
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self { tx: Some(tx) }
    }

    fn active(&mut self) -> OrmResult<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let query = build_query(sql, params)?;
        let tx = self.active()?;

        let result = query.execute(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let query = build_query(sql, params)?;
        let tx = self.active()?;

        let rows = query.fetch_all(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows.into_iter().map(|row| Box::new(SqliteRow::new(row)) as Box<dyn DatabaseRow>).collect())
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>> {
        let query = build_query(sql, params)?;
        let tx = self.active()?;

        let row = query.fetch_optional(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(SqliteRow::new(r)) as Box<dyn DatabaseRow>))
    }

    async fn commit(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self.tx.take().ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| OrmError::Transaction(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self.tx.take().ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| OrmError::Transaction(format!("Transaction rollback failed: {}", e)))
    }
}

/// SQLite row implementation
pub struct SqliteRow {
    row: sqlx::sqlite::SqliteRow,
}

impl SqliteRow {
    pub fn new(row: sqlx::sqlite::SqliteRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for SqliteRow {
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue> {
        sqlite_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue> {
        let index = self.row.columns().iter().position(|col| col.name() == name)
            .ok_or_else(|| OrmError::Query(format!("Column '{}' not found", name)))?;

        sqlite_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.row.columns().iter().map(|col| col.name().to_string()).collect()
    }
}

fn build_query<'q>(sql: &'q str, params: &[DatabaseValue]) -> OrmResult<SqliteQuery<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_database_value(query, param)?;
    }
    Ok(query)
}

/// Bind a DatabaseValue to a sqlx query.
///
/// Temporal, UUID and JSON values are stored as text so they read back the
/// same way they were written.
fn bind_database_value<'q>(query: SqliteQuery<'q>, value: &DatabaseValue) -> OrmResult<SqliteQuery<'q>> {
    match value {
        DatabaseValue::Null => Ok(query.bind(Option::<String>::None)),
        DatabaseValue::Bool(b) => Ok(query.bind(*b)),
        DatabaseValue::Int32(i) => Ok(query.bind(*i)),
        DatabaseValue::Int64(i) => Ok(query.bind(*i)),
        DatabaseValue::Float32(f) => Ok(query.bind(*f)),
        DatabaseValue::Float64(f) => Ok(query.bind(*f)),
        DatabaseValue::String(s) => Ok(query.bind(s.clone())),
        DatabaseValue::Bytes(b) => Ok(query.bind(b.clone())),
        DatabaseValue::Uuid(u) => Ok(query.bind(u.to_string())),
        DatabaseValue::DateTime(dt) => Ok(query.bind(dt.to_rfc3339())),
        DatabaseValue::Date(d) => Ok(query.bind(d.to_string())),
        DatabaseValue::Time(t) => Ok(query.bind(t.to_string())),
        DatabaseValue::Json(j) => Ok(query.bind(j.to_string())),
        DatabaseValue::Array(_) => Err(OrmError::Query("Array values must be expanded before binding".to_string())),
    }
}

/// Convert a SQLite value to DatabaseValue using its storage class
fn sqlite_value_to_database_value(row: &sqlx::sqlite::SqliteRow, index: usize) -> OrmResult<DatabaseValue> {
    use sqlx::{TypeInfo, ValueRef};

    let raw = row.try_get_raw(index)
        .map_err(|e| OrmError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }
    let storage = raw.type_info().name().to_string();

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).map(DatabaseValue::Int64),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(DatabaseValue::Float64),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(index).map(DatabaseValue::Bytes),
        _ => row.try_get_unchecked::<String, _>(index).map(DatabaseValue::String),
    };

    value.map_err(|e| OrmError::Query(format!("Failed to decode {} value: {}", storage, e)))
}

impl Default for SqliteBackend {
    fn default() -> Self {
        Self::new()
    }
}
