//! Database handle
//!
//! [`Db`] is the entry point of the engine: it owns the connection pool, the
//! schema registry and the callback chains, and carries per-handle query
//! state. Chain builders consume and return the handle, so a derived query
//! never affects the handle it came from.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backends::{
    DatabaseBackendRegistry, DatabasePool, DatabaseRow, DatabaseTransaction, DatabaseValue, SqlDialect,
};
use crate::callbacks::{self, CallbackKind, CallbackRegistry, Callbacks};
use crate::config::OrmConfig;
use crate::error::{ModelError, ModelResult};
use crate::schema::entity::{decode, encode};
use crate::schema::{Entity, EntityMetadata, EntityRef, SchemaRegistry};
use crate::scope::Scope;
use crate::search::{self, Condition, PreloadSpec, Search};

/// Boxed future used where the persistence pipeline recurses into itself
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type TransactionSlot = Arc<Mutex<Option<Box<dyn DatabaseTransaction>>>>;

/// Where statements run
#[derive(Clone)]
pub(crate) enum Executor {
    Pool(Arc<dyn DatabasePool>),
    Transaction(TransactionSlot),
}

fn finished_transaction() -> ModelError {
    ModelError::Transaction("transaction has already been committed or rolled back".to_string())
}

impl Executor {
    pub(crate) fn is_transaction(&self) -> bool {
        matches!(self, Executor::Transaction(_))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> ModelResult<u64> {
        match self {
            Executor::Pool(pool) => pool.execute(sql, params).await,
            Executor::Transaction(slot) => {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(tx) => tx.execute(sql, params).await,
                    None => Err(finished_transaction()),
                }
            }
        }
    }

    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> ModelResult<Vec<Box<dyn DatabaseRow>>> {
        match self {
            Executor::Pool(pool) => pool.fetch_all(sql, params).await,
            Executor::Transaction(slot) => {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(tx) => tx.fetch_all(sql, params).await,
                    None => Err(finished_transaction()),
                }
            }
        }
    }

    async fn fetch_optional(&self, sql: &str, params: &[DatabaseValue]) -> ModelResult<Option<Box<dyn DatabaseRow>>> {
        match self {
            Executor::Pool(pool) => pool.fetch_optional(sql, params).await,
            Executor::Transaction(slot) => {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(tx) => tx.fetch_optional(sql, params).await,
                    None => Err(finished_transaction()),
                }
            }
        }
    }

    /// Take the open transaction out of its slot
    async fn take_transaction(&self) -> ModelResult<Box<dyn DatabaseTransaction>> {
        match self {
            Executor::Transaction(slot) => slot.lock().await.take().ok_or_else(finished_transaction),
            Executor::Pool(_) => Err(ModelError::Transaction("no transaction in progress".to_string())),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) pool: Arc<dyn DatabasePool>,
    pub(crate) dialect: SqlDialect,
    pub(crate) config: OrmConfig,
    pub(crate) schema: Arc<SchemaRegistry>,
    pub(crate) callbacks: RwLock<CallbackRegistry>,
}

/// Per-call switches that override annotation settings
#[derive(Debug, Clone, Default)]
pub(crate) struct CallOptions {
    pub(crate) save_associations: Option<bool>,
    pub(crate) association_autoupdate: Option<bool>,
    pub(crate) association_autocreate: Option<bool>,
    pub(crate) association_save_reference: Option<bool>,
    /// Write the given columns only, skipping hooks and timestamps
    pub(crate) update_column: bool,
}

/// Database handle
#[derive(Clone)]
pub struct Db {
    pub(crate) shared: Arc<Shared>,
    pub(crate) executor: Executor,
    pub(crate) search: Search,
    pub(crate) options: CallOptions,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("dialect", &self.shared.dialect)
            .field("in_transaction", &self.executor.is_transaction())
            .field("search", &self.search)
            .finish()
    }
}

impl Db {
    /// Connect using the backend matching the URL scheme
    pub async fn connect(database_url: &str, config: OrmConfig) -> ModelResult<Self> {
        config.validate()?;
        let backend = DatabaseBackendRegistry::with_defaults().backend_for_url(database_url)?;
        backend.validate_database_url(database_url)?;
        let pool = backend.create_pool(database_url, config.pool.clone()).await?;
        debug!(backend = %backend.backend_type(), "connected");
        Ok(Self::from_pool(pool, backend.sql_dialect(), config))
    }

    /// Wrap an existing pool with a fresh schema registry
    pub fn from_pool(pool: Arc<dyn DatabasePool>, dialect: SqlDialect, config: OrmConfig) -> Self {
        Self::from_pool_with_schema(pool, dialect, config, Arc::new(SchemaRegistry::new()))
    }

    /// Wrap an existing pool, sharing a schema registry with other handles
    pub fn from_pool_with_schema(
        pool: Arc<dyn DatabasePool>,
        dialect: SqlDialect,
        config: OrmConfig,
        schema: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: pool.clone(),
                dialect,
                config,
                schema,
                callbacks: RwLock::new(CallbackRegistry::with_defaults()),
            }),
            executor: Executor::Pool(pool),
            search: Search::default(),
            options: CallOptions::default(),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.shared.dialect
    }

    pub fn config(&self) -> &OrmConfig {
        &self.shared.config
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.shared.schema
    }

    pub fn search(&self) -> &Search {
        &self.search
    }

    pub fn in_transaction(&self) -> bool {
        self.executor.is_transaction()
    }

    /// Metadata of `T`, resolved on first use
    pub fn metadata<T: Entity>(&self) -> Arc<EntityMetadata> {
        self.shared.schema.get::<T>()
    }

    pub fn metadata_of(&self, entity: EntityRef) -> Arc<EntityMetadata> {
        self.shared.schema.get_or_build(entity)
    }

    /// Register, replace or remove callbacks
    pub fn callback(&self) -> Callbacks<'_> {
        Callbacks::new(&self.shared.callbacks)
    }

    /// A handle on the same connection with empty query state and options
    pub(crate) fn new_session(&self) -> Db {
        Db {
            shared: self.shared.clone(),
            executor: self.executor.clone(),
            search: Search::default(),
            options: CallOptions::default(),
        }
    }

    // ----- chain builders -----

    /// Add a condition; `?` marks arguments
    pub fn where_(mut self, sql: &str, args: Vec<DatabaseValue>) -> Self {
        self.search.conditions.push(Condition::new(sql, args));
        self
    }

    pub fn joins(mut self, sql: &str, args: Vec<DatabaseValue>) -> Self {
        self.search.joins.push(Condition::new(sql, args));
        self
    }

    pub fn order(mut self, order: &str) -> Self {
        self.search.orders.push(order.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.search.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.search.offset = Some(offset);
        self
    }

    /// Restrict selected columns on queries, and the written fields on saves
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search.selects = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude fields from saves
    pub fn omit<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search.omits = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.search.table = Some(table.to_string());
        self
    }

    /// Include soft-deleted rows, and delete rows for real
    pub fn unscoped(mut self) -> Self {
        self.search.unscoped = true;
        self
    }

    /// Eager-load a dotted relationship path such as `"orders.items"`
    pub fn preload(mut self, path: &str) -> Self {
        self.search.preloads.push(PreloadSpec::new(path));
        self
    }

    /// Eager-load a path, filtering the last segment's rows
    pub fn preload_where(mut self, path: &str, sql: &str, args: Vec<DatabaseValue>) -> Self {
        let mut spec = PreloadSpec::new(path);
        spec.conditions.push(Condition::new(sql, args));
        self.search.preloads.push(spec);
        self
    }

    /// Eager-load a path, adjusting the query of the last segment
    pub fn preload_with<F>(mut self, path: &str, customize: F) -> Self
    where
        F: Fn(Db) -> Db + Send + Sync + 'static,
    {
        let mut spec = PreloadSpec::new(path);
        spec.customize = Some(Arc::new(customize));
        self.search.preloads.push(spec);
        self
    }

    pub fn set_save_associations(mut self, enabled: bool) -> Self {
        self.options.save_associations = Some(enabled);
        self
    }

    pub fn set_association_autoupdate(mut self, enabled: bool) -> Self {
        self.options.association_autoupdate = Some(enabled);
        self
    }

    pub fn set_association_autocreate(mut self, enabled: bool) -> Self {
        self.options.association_autocreate = Some(enabled);
        self
    }

    pub fn set_association_save_reference(mut self, enabled: bool) -> Self {
        self.options.association_save_reference = Some(enabled);
        self
    }

    // ----- transactions -----

    /// Open a transaction; the returned handle runs every statement inside it
    pub async fn begin(&self) -> ModelResult<Db> {
        if self.executor.is_transaction() {
            return Err(ModelError::Transaction("already inside a transaction".to_string()));
        }
        let tx = self.shared.pool.begin_transaction().await?;
        let mut db = self.clone();
        db.executor = Executor::Transaction(Arc::new(Mutex::new(Some(tx))));
        Ok(db)
    }

    pub async fn commit(&self) -> ModelResult<()> {
        self.executor.take_transaction().await?.commit().await
    }

    pub async fn rollback(&self) -> ModelResult<()> {
        self.executor.take_transaction().await?.rollback().await
    }

    /// Open a transaction for one pipeline run. Returns `None` when the
    /// handle already runs inside a transaction.
    pub(crate) async fn begin_nested(&self) -> Option<ModelResult<Executor>> {
        if self.executor.is_transaction() {
            return None;
        }
        Some(
            self.shared
                .pool
                .begin_transaction()
                .await
                .map(|tx| Executor::Transaction(Arc::new(Mutex::new(Some(tx))))),
        )
    }

    pub(crate) async fn finish_transaction(&self, commit: bool) -> ModelResult<()> {
        let tx = self.executor.take_transaction().await?;
        if commit {
            tx.commit().await
        } else {
            tx.rollback().await
        }
    }

    // ----- raw statements -----

    fn trace_sql(&self, sql: &str, args: &[DatabaseValue]) {
        if self.shared.config.log_sql {
            debug!(target: "tether_orm::sql", sql = %sql, args = ?args, "statement");
        }
    }

    /// Run rendered SQL
    pub(crate) async fn execute_raw(&self, sql: &str, args: Vec<DatabaseValue>) -> ModelResult<u64> {
        self.trace_sql(sql, &args);
        self.executor.execute(sql, &args).await
    }

    pub(crate) async fn fetch_raw(&self, sql: &str, args: Vec<DatabaseValue>) -> ModelResult<Vec<Box<dyn DatabaseRow>>> {
        self.trace_sql(sql, &args);
        self.executor.fetch_all(sql, &args).await
    }

    pub(crate) async fn fetch_optional_raw(
        &self,
        sql: &str,
        args: Vec<DatabaseValue>,
    ) -> ModelResult<Option<Box<dyn DatabaseRow>>> {
        self.trace_sql(sql, &args);
        self.executor.fetch_optional(sql, &args).await
    }

    /// Execute a statement with `?` argument markers
    pub async fn exec(&self, sql: &str, args: Vec<DatabaseValue>) -> ModelResult<u64> {
        let (sql, args) = search::render(self.dialect(), sql, &args);
        self.execute_raw(&sql, args).await
    }

    /// Run a query with `?` argument markers and return its rows by column
    pub async fn query_raw(&self, sql: &str, args: Vec<DatabaseValue>) -> ModelResult<Vec<HashMap<String, DatabaseValue>>> {
        let (sql, args) = search::render(self.dialect(), sql, &args);
        let rows = self.fetch_raw(&sql, args).await?;
        rows.iter().map(|row| row.to_map()).collect()
    }

    // ----- typed operations -----

    /// Insert a record, cascading through its relationships
    pub async fn create<T: Entity>(&self, value: &mut T) -> ModelResult<()> {
        let meta = self.metadata::<T>();
        let mut json = encode(value)?;
        let outcome = self.create_value(meta, &mut json).await;
        *value = decode(json)?;
        outcome.map(|_| ())
    }

    /// Create when the primary key is blank, otherwise update
    pub async fn save<T: Entity>(&self, value: &mut T) -> ModelResult<()> {
        let meta = self.metadata::<T>();
        let mut json = encode(value)?;
        let outcome = self.save_value(meta, &mut json).await;
        *value = decode(json)?;
        outcome
    }

    /// Write the given columns only, without hooks, timestamps or cascades.
    /// Returns the number of rows affected.
    pub async fn update_columns<T: Entity>(&self, value: &mut T, columns: JsonValue) -> ModelResult<u64> {
        let JsonValue::Object(columns) = columns else {
            return Err(ModelError::Query("update_columns expects a JSON object".to_string()));
        };
        let meta = self.metadata::<T>();
        let mut json = encode(value)?;
        let outcome = self.update_columns_value(meta, &mut json, columns).await;
        *value = decode(json)?;
        outcome
    }

    /// Delete a record, or soft-delete it when it has a `deleted_at` field
    pub async fn delete<T: Entity>(&self, value: &T) -> ModelResult<u64> {
        let meta = self.metadata::<T>();
        let mut json = encode(value)?;
        self.delete_value(meta, &mut json).await
    }

    /// First matching record ordered by primary key
    pub async fn first<T: Entity>(&self) -> ModelResult<T> {
        let meta = self.metadata::<T>();
        let value = self.first_value(meta, JsonValue::Object(Map::new())).await?;
        decode(value)
    }

    /// Reload a record by its primary key
    pub async fn reload<T: Entity>(&self, value: &mut T) -> ModelResult<()> {
        let meta = self.metadata::<T>();
        let json = encode(value)?;
        if meta.primary_key_zero(&json) {
            return Err(ModelError::MissingPrimaryKey);
        }
        let json = self.first_value(meta, json).await?;
        *value = decode(json)?;
        Ok(())
    }

    /// All matching records
    pub async fn find<T: Entity>(&self) -> ModelResult<Vec<T>> {
        let meta = self.metadata::<T>();
        self.find_values(meta).await?.into_iter().map(decode).collect()
    }

    pub async fn count<T: Entity>(&self) -> ModelResult<i64> {
        let meta = self.metadata::<T>();
        self.count_value(meta).await
    }

    /// Raw rows of a query over `T`'s table, through the row-query chain
    pub async fn rows<T: Entity>(&self) -> ModelResult<Vec<HashMap<String, DatabaseValue>>> {
        let meta = self.metadata::<T>();
        let rows = self.rows_value(meta).await?;
        rows.iter().map(|row| row.to_map()).collect()
    }

    // ----- JSON-level operations used by cascades and association handles -----

    pub(crate) async fn create_value(&self, meta: Arc<EntityMetadata>, value: &mut JsonValue) -> ModelResult<u64> {
        let mut scope = Scope::new(self.clone(), meta, std::mem::take(value));
        callbacks::run(CallbackKind::Create, &mut scope).await;
        *value = scope.take_value();
        scope.into_result()
    }

    pub(crate) async fn update_value(&self, meta: Arc<EntityMetadata>, value: &mut JsonValue) -> ModelResult<u64> {
        let mut scope = Scope::new(self.clone(), meta, std::mem::take(value));
        callbacks::run(CallbackKind::Update, &mut scope).await;
        *value = scope.take_value();
        scope.into_result()
    }

    pub(crate) async fn update_columns_value(
        &self,
        meta: Arc<EntityMetadata>,
        value: &mut JsonValue,
        columns: Map<String, JsonValue>,
    ) -> ModelResult<u64> {
        let mut db = self.clone();
        db.options.update_column = true;
        db.options.save_associations = Some(false);
        let mut scope = Scope::new(db, meta, std::mem::take(value));
        scope.update_interface = Some(columns);
        callbacks::run(CallbackKind::Update, &mut scope).await;
        *value = scope.take_value();
        scope.into_result()
    }

    /// Save through the pipeline. Boxed because cascades recurse into it.
    pub(crate) fn save_value<'a>(
        &'a self,
        meta: Arc<EntityMetadata>,
        value: &'a mut JsonValue,
    ) -> BoxFuture<'a, ModelResult<()>> {
        Box::pin(async move {
            if meta.primary_key_zero(value) {
                return self.create_value(meta, value).await.map(|_| ());
            }
            let affected = self.update_value(meta.clone(), value).await?;
            if affected > 0 {
                return Ok(());
            }
            let probe = self.new_session().table(&self.table_for(&meta));
            match probe.first_value(meta.clone(), value.clone()).await {
                Ok(_) => Ok(()),
                Err(error) if error.is_record_not_found() => {
                    self.create_value(meta, value).await.map(|_| ())
                }
                Err(error) => Err(error),
            }
        })
    }

    pub(crate) async fn delete_value(&self, meta: Arc<EntityMetadata>, value: &mut JsonValue) -> ModelResult<u64> {
        let mut scope = Scope::new(self.clone(), meta, std::mem::take(value));
        callbacks::run(CallbackKind::Delete, &mut scope).await;
        *value = scope.take_value();
        scope.into_result()
    }

    pub(crate) async fn first_value(&self, meta: Arc<EntityMetadata>, value: JsonValue) -> ModelResult<JsonValue> {
        let mut db = self.clone();
        if let Some(primary) = meta.primary_field() {
            let dialect = db.dialect();
            db.search.orders.push(format!(
                "{}.{} ASC",
                dialect.quote(&db.table_for(&meta)),
                dialect.quote(primary.column())
            ));
        }
        db.search.limit = Some(1);
        let mut scope = Scope::new(db, meta, value);
        callbacks::run(CallbackKind::Query, &mut scope).await;
        let value = scope.take_value();
        scope.into_result()?;
        Ok(value)
    }

    pub(crate) async fn find_values(&self, meta: Arc<EntityMetadata>) -> ModelResult<Vec<JsonValue>> {
        let mut scope = Scope::new(self.clone(), meta, JsonValue::Array(Vec::new()));
        scope.many = true;
        callbacks::run(CallbackKind::Query, &mut scope).await;
        let value = scope.take_value();
        scope.into_result()?;
        match value {
            JsonValue::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    pub(crate) async fn count_value(&self, meta: Arc<EntityMetadata>) -> ModelResult<i64> {
        let mut db = self.clone();
        db.search.selects = vec!["count(*)".to_string()];
        db.search.orders.clear();
        db.search.limit = None;
        db.search.offset = None;
        let rows = db.rows_value(meta).await?;
        match rows.first() {
            Some(row) => row
                .get_by_index(0)?
                .as_i64()
                .ok_or_else(|| ModelError::Query("count(*) did not return an integer".to_string())),
            None => Ok(0),
        }
    }

    pub(crate) async fn rows_value(&self, meta: Arc<EntityMetadata>) -> ModelResult<Vec<Box<dyn DatabaseRow>>> {
        let mut scope = Scope::new(self.clone(), meta, JsonValue::Array(Vec::new()));
        scope.many = true;
        callbacks::run(CallbackKind::RowQuery, &mut scope).await;
        let rows = std::mem::take(&mut scope.rows);
        scope.into_result()?;
        Ok(rows)
    }

    /// Table a statement for `meta` targets on this handle
    pub(crate) fn table_for(&self, meta: &EntityMetadata) -> String {
        self.search
            .table
            .clone()
            .unwrap_or_else(|| meta.table_name().to_string())
    }
}
