//! Core Database Backend Traits
//!
//! This module defines the traits and types the ORM uses to talk to a database.
//! Backends implement them on top of a concrete driver; the rest of the crate
//! only sees `DatabasePool`, `DatabaseTransaction` and `DatabaseRow`.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use crate::error::{OrmResult, OrmError};
use crate::schema::ScalarKind;

/// Abstract database transaction trait.
///
/// Only `Send` is required: a transaction is used by one task at a time, and a
/// shared handle keeps it behind a mutex.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Execute a query within the transaction
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64>;

    /// Execute a query and return result rows within the transaction
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>>;

    /// Execute a query and return the first result row within the transaction
    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> OrmResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> OrmResult<()>;
}

/// Abstract database connection pool trait
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Begin a transaction from the pool
    async fn begin_transaction(&self) -> OrmResult<Box<dyn DatabaseTransaction>>;

    /// Execute a query directly on the pool
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64>;

    /// Execute a query and return result rows directly on the pool
    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>>;

    /// Execute a query and return the first result row directly on the pool
    async fn fetch_optional(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>>;

    /// Close the pool
    async fn close(&self) -> OrmResult<()>;
}

/// Abstract database row trait
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;

    /// Get column names
    fn column_names(&self) -> Vec<String>;

    /// Convert row to HashMap
    fn to_map(&self) -> OrmResult<HashMap<String, DatabaseValue>> {
        let mut map = HashMap::new();
        for (i, name) in self.column_names().into_iter().enumerate() {
            map.insert(name, self.get_by_index(i)?);
        }
        Ok(map)
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    Json(JsonValue),
    /// Expands to a comma separated placeholder list when rendered
    Array(Vec<DatabaseValue>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Interpret the value as an integer, used for `COUNT(*)` style results
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(*i as i64),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::Bool(b) => Some(*b as i64),
            DatabaseValue::Float32(f) => Some(*f as i64),
            DatabaseValue::Float64(f) => Some(*f as i64),
            DatabaseValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Float32(f) => serde_json::Number::from_f64(*f as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(b.iter().map(|&x| JsonValue::Number(serde_json::Number::from(x))).collect()),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Date(d) => JsonValue::String(d.to_string()),
            DatabaseValue::Time(t) => JsonValue::String(t.to_string()),
            DatabaseValue::Json(j) => j.clone(),
            DatabaseValue::Array(arr) => JsonValue::Array(arr.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Convert a field's JSON value into a bindable value, guided by the
    /// field's declared scalar kind.
    pub fn from_field_json(kind: ScalarKind, value: &JsonValue) -> Self {
        if value.is_null() {
            return DatabaseValue::Null;
        }

        match kind {
            ScalarKind::Bool => match value {
                JsonValue::Bool(b) => DatabaseValue::Bool(*b),
                JsonValue::Number(n) => DatabaseValue::Bool(n.as_i64().unwrap_or(0) != 0),
                other => DatabaseValue::from_json(other.clone()),
            },
            ScalarKind::Int => match value.as_i64() {
                Some(i) => DatabaseValue::Int64(i),
                None => DatabaseValue::from_json(value.clone()),
            },
            ScalarKind::Float => match value.as_f64() {
                Some(f) => DatabaseValue::Float64(f),
                None => DatabaseValue::from_json(value.clone()),
            },
            ScalarKind::Text => match value {
                JsonValue::String(s) => DatabaseValue::String(s.clone()),
                other => DatabaseValue::String(other.to_string()),
            },
            ScalarKind::DateTime => match value.as_str().and_then(parse_datetime) {
                Some(dt) => DatabaseValue::DateTime(dt),
                None => DatabaseValue::from_json(value.clone()),
            },
            ScalarKind::Date => match value.as_str().and_then(|s| s.parse::<chrono::NaiveDate>().ok()) {
                Some(d) => DatabaseValue::Date(d),
                None => DatabaseValue::from_json(value.clone()),
            },
            ScalarKind::Uuid => match value.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok()) {
                Some(u) => DatabaseValue::Uuid(u),
                None => DatabaseValue::from_json(value.clone()),
            },
            ScalarKind::Bytes => match value {
                JsonValue::Array(items) => DatabaseValue::Bytes(
                    items.iter().filter_map(|v| v.as_u64()).map(|b| b as u8).collect(),
                ),
                JsonValue::String(s) => DatabaseValue::Bytes(s.as_bytes().to_vec()),
                other => DatabaseValue::from_json(other.clone()),
            },
            ScalarKind::Json => DatabaseValue::Json(value.clone()),
        }
    }

    /// Convert a value read from a row into the JSON shape the field's Rust
    /// type deserializes from.
    pub fn into_field_json(self, kind: ScalarKind) -> JsonValue {
        match (kind, self) {
            (_, DatabaseValue::Null) => JsonValue::Null,
            (ScalarKind::Bool, DatabaseValue::Int32(i)) => JsonValue::Bool(i != 0),
            (ScalarKind::Bool, DatabaseValue::Int64(i)) => JsonValue::Bool(i != 0),
            (ScalarKind::Bool, DatabaseValue::String(s)) => {
                JsonValue::Bool(matches!(s.to_lowercase().as_str(), "1" | "t" | "true"))
            }
            (ScalarKind::Int, DatabaseValue::String(s)) => s
                .parse::<i64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::String(s)),
            (ScalarKind::Float, DatabaseValue::Int64(i)) => JsonValue::from(i as f64),
            (ScalarKind::Float, DatabaseValue::Int32(i)) => JsonValue::from(i as f64),
            (ScalarKind::DateTime, DatabaseValue::String(s)) => match parse_datetime(&s) {
                Some(dt) => JsonValue::String(dt.to_rfc3339()),
                None => JsonValue::String(s),
            },
            (ScalarKind::Json, DatabaseValue::String(s)) => {
                serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
            }
            (ScalarKind::Text, DatabaseValue::Bytes(b)) => {
                JsonValue::String(String::from_utf8_lossy(&b).into_owned())
            }
            (_, other) => other.to_json(),
        }
    }

    /// Create DatabaseValue from JSON value
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => DatabaseValue::Null,
            JsonValue::Bool(b) => DatabaseValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DatabaseValue::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    DatabaseValue::Float64(f)
                } else {
                    DatabaseValue::Null
                }
            }
            JsonValue::String(s) => DatabaseValue::String(s),
            JsonValue::Array(arr) => {
                DatabaseValue::Array(arr.into_iter().map(DatabaseValue::from_json).collect())
            }
            JsonValue::Object(_) => DatabaseValue::Json(json),
        }
    }
}

/// Parse the timestamp layouts databases hand back as text.
pub(crate) fn parse_datetime(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(dt) = chrono::DateTime::parse_from_str(value, layout) {
            return Some(dt.with_timezone(&chrono::Utc));
        }
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, layout) {
            return Some(naive.and_utc());
        }
    }
    None
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

impl<T> From<Vec<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Vec<T>) -> Self {
        DatabaseValue::Array(value.into_iter().map(Into::into).collect())
    }
}

/// Column type request handed to the dialect when generating DDL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub kind: ScalarKind,
    pub size: Option<usize>,
    pub auto_increment: bool,
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Quote a single identifier
    pub fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Map a column request to this dialect's SQL type.
    ///
    /// For an auto-increment key on SQLite the returned type already carries
    /// the `PRIMARY KEY` clause, see [`SqlDialect::inlines_primary_key`].
    pub fn data_type_of(&self, column: ColumnType) -> String {
        let size = column.size.unwrap_or(0);
        match self {
            SqlDialect::SQLite => match column.kind {
                ScalarKind::Bool => "bool".to_string(),
                ScalarKind::Int if column.auto_increment => "integer primary key autoincrement".to_string(),
                ScalarKind::Int => "integer".to_string(),
                ScalarKind::Float => "real".to_string(),
                ScalarKind::Text if size > 0 && size < 65532 => format!("varchar({})", size),
                ScalarKind::Text => "varchar(255)".to_string(),
                ScalarKind::DateTime => "datetime".to_string(),
                ScalarKind::Date => "date".to_string(),
                ScalarKind::Bytes => "blob".to_string(),
                ScalarKind::Uuid => "varchar(36)".to_string(),
                ScalarKind::Json => "text".to_string(),
            },
            SqlDialect::PostgreSQL => match column.kind {
                ScalarKind::Bool => "boolean".to_string(),
                ScalarKind::Int if column.auto_increment => "bigserial".to_string(),
                ScalarKind::Int => "bigint".to_string(),
                ScalarKind::Float => "double precision".to_string(),
                ScalarKind::Text if size > 0 && size < 65532 => format!("varchar({})", size),
                ScalarKind::Text => "text".to_string(),
                ScalarKind::DateTime => "timestamp with time zone".to_string(),
                ScalarKind::Date => "date".to_string(),
                ScalarKind::Bytes => "bytea".to_string(),
                ScalarKind::Uuid => "uuid".to_string(),
                ScalarKind::Json => "jsonb".to_string(),
            },
        }
    }

    /// Whether [`SqlDialect::data_type_of`] already declared the primary key
    pub fn inlines_primary_key(&self, column: ColumnType) -> bool {
        matches!(self, SqlDialect::SQLite) && column.kind == ScalarKind::Int && column.auto_increment
    }

    /// Query counting tables with the bound name
    pub fn has_table_sql(&self) -> String {
        match self {
            SqlDialect::PostgreSQL => "SELECT count(*) FROM INFORMATION_SCHEMA.tables WHERE table_name = $1 AND table_type = 'BASE TABLE' AND table_schema = CURRENT_SCHEMA()".to_string(),
            SqlDialect::SQLite => "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?".to_string(),
        }
    }

    /// Query counting columns with the bound table and column names
    pub fn has_column_sql(&self) -> String {
        match self {
            SqlDialect::PostgreSQL => "SELECT count(*) FROM INFORMATION_SCHEMA.columns WHERE table_name = $1 AND column_name = $2 AND table_schema = CURRENT_SCHEMA()".to_string(),
            SqlDialect::SQLite => "SELECT count(*) FROM pragma_table_info(?) WHERE name = ?".to_string(),
        }
    }
}

/// Database backend trait that provides database-specific implementations
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Create a connection pool from a database URL
    async fn create_pool(&self, database_url: &str, config: DatabasePoolConfig) -> OrmResult<Arc<dyn DatabasePool>>;

    /// Get the SQL dialect used by this backend
    fn sql_dialect(&self) -> SqlDialect;

    /// Get the backend type
    fn backend_type(&self) -> crate::backends::DatabaseBackendType;

    /// Validate a database URL for this backend
    fn validate_database_url(&self, url: &str) -> OrmResult<()>;
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600), // 10 minutes
            max_lifetime_seconds: Some(1800), // 30 minutes
            test_before_acquire: true,
        }
    }
}

impl DatabasePoolConfig {
    /// A single long-lived connection, required for `sqlite::memory:` databases
    /// where every new connection would see an empty database.
    pub fn single_connection() -> Self {
        Self {
            max_connections: 1,
            min_connections: 1,
            idle_timeout_seconds: None,
            max_lifetime_seconds: None,
            ..Self::default()
        }
    }
}

/// Database backend registry for managing multiple backend implementations
pub struct DatabaseBackendRegistry {
    backends: HashMap<crate::backends::DatabaseBackendType, Arc<dyn DatabaseBackend>>,
}

impl DatabaseBackendRegistry {
    /// Create a new backend registry
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with the PostgreSQL and SQLite backends installed
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            crate::backends::DatabaseBackendType::PostgreSQL,
            Arc::new(crate::backends::PostgresBackend::new()),
        );
        registry.register(
            crate::backends::DatabaseBackendType::SQLite,
            Arc::new(crate::backends::SqliteBackend::new()),
        );
        registry
    }

    /// Register a database backend
    pub fn register(&mut self, backend_type: crate::backends::DatabaseBackendType, backend: Arc<dyn DatabaseBackend>) {
        self.backends.insert(backend_type, backend);
    }

    /// Get a database backend by type
    pub fn get(&self, backend_type: &crate::backends::DatabaseBackendType) -> Option<Arc<dyn DatabaseBackend>> {
        self.backends.get(backend_type).cloned()
    }

    /// Resolve the backend responsible for the given URL
    pub fn backend_for_url(&self, database_url: &str) -> OrmResult<Arc<dyn DatabaseBackend>> {
        let backend_type = self.detect_backend_from_url(database_url)?;
        let backend = self.get(&backend_type)
            .ok_or_else(|| OrmError::Connection(format!("No backend registered for {}", backend_type)))?;
        backend.validate_database_url(database_url)?;
        Ok(backend)
    }

    /// Detect database backend type from URL
    fn detect_backend_from_url(&self, url: &str) -> OrmResult<crate::backends::DatabaseBackendType> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Ok(crate::backends::DatabaseBackendType::PostgreSQL)
        } else if url.starts_with("sqlite:") || url.starts_with("file:") {
            Ok(crate::backends::DatabaseBackendType::SQLite)
        } else {
            Err(OrmError::Connection(format!("Unable to detect database backend from URL: {}", url)))
        }
    }
}

impl Default for DatabaseBackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_escapes_identifier() {
        assert_eq!(SqlDialect::SQLite.quote("users"), "\"users\"");
        assert_eq!(SqlDialect::PostgreSQL.quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_sqlite_auto_increment_inlines_primary_key() {
        let column = ColumnType { kind: ScalarKind::Int, size: None, auto_increment: true };
        assert_eq!(SqlDialect::SQLite.data_type_of(column), "integer primary key autoincrement");
        assert!(SqlDialect::SQLite.inlines_primary_key(column));
        assert_eq!(SqlDialect::PostgreSQL.data_type_of(column), "bigserial");
        assert!(!SqlDialect::PostgreSQL.inlines_primary_key(column));
    }

    #[test]
    fn test_field_json_coercion() {
        assert_eq!(
            DatabaseValue::from_field_json(ScalarKind::Int, &json!(7)),
            DatabaseValue::Int64(7)
        );
        assert_eq!(DatabaseValue::from_field_json(ScalarKind::Text, &json!(null)), DatabaseValue::Null);
        assert_eq!(DatabaseValue::Int64(1).into_field_json(ScalarKind::Bool), json!(true));
        assert_eq!(
            DatabaseValue::String("{\"a\":1}".into()).into_field_json(ScalarKind::Json),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_parse_datetime_layouts() {
        assert!(parse_datetime("2024-03-01T10:00:00+00:00").is_some());
        assert!(parse_datetime("2024-03-01 10:00:00").is_some());
        assert!(parse_datetime("2024-03-01 10:00:00.123+00:00").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_detect_backend_from_url() {
        let registry = DatabaseBackendRegistry::with_defaults();
        assert!(registry.backend_for_url("sqlite::memory:").is_ok());
        assert!(registry.backend_for_url("postgres://localhost/app").is_ok());
        assert!(registry.backend_for_url("mysql://localhost/app").is_err());
        assert!(registry.backend_for_url("redis://localhost").is_err());
    }
}
