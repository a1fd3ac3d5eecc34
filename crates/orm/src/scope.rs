//! Per-operation state
//!
//! A [`Scope`] is created for every top-level operation and handed through the
//! callback chain of that operation. It owns the instance being written or
//! read, the errors collected so far, and the transaction it may have opened.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::backends::{DatabaseRow, DatabaseValue, SqlDialect};
use crate::db::Db;
use crate::error::{ModelError, ModelResult};
use crate::keys;
use crate::schema::{EntityMetadata, FieldMetadata, HookPoint};
use crate::search::{Condition, SqlBuilder};

/// State of one create, update, delete or query run
pub struct Scope {
    pub(crate) db: Db,
    meta: Arc<EntityMetadata>,
    pub(crate) value: JsonValue,
    errors: Vec<ModelError>,
    pub(crate) skip_left: bool,
    pub(crate) rows_affected: u64,
    pub(crate) opened_transaction: bool,
    /// Column values an update writes, keyed by column
    pub(crate) update_attrs: Option<BTreeMap<String, JsonValue>>,
    /// Raw attributes handed to an update, keyed by field or column name
    pub(crate) update_interface: Option<Map<String, JsonValue>>,
    /// The value is a sequence of instances
    pub(crate) many: bool,
    pub(crate) rows: Vec<Box<dyn DatabaseRow>>,
}

impl Scope {
    pub(crate) fn new(db: Db, meta: Arc<EntityMetadata>, value: JsonValue) -> Self {
        Self {
            db,
            meta,
            value,
            errors: Vec::new(),
            skip_left: false,
            rows_affected: 0,
            opened_transaction: false,
            update_attrs: None,
            update_interface: None,
            many: false,
            rows: Vec::new(),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.meta
    }

    /// JSON form of the instance, or an array of instances for queries
    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut JsonValue {
        &mut self.value
    }

    pub(crate) fn take_value(&mut self) -> JsonValue {
        std::mem::take(&mut self.value)
    }

    pub fn add_error(&mut self, error: ModelError) {
        self.errors.push(error);
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Collected errors, deduplicated into one
    pub fn error(&self) -> Option<ModelError> {
        ModelError::combine(self.errors.clone())
    }

    /// Stop the chain after the current callback
    pub fn skip_left(&mut self) {
        self.skip_left = true;
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub(crate) fn into_result(self) -> ModelResult<u64> {
        match ModelError::combine(self.errors) {
            Some(error) => Err(error),
            None => Ok(self.rows_affected),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.db.dialect()
    }

    /// Table the operation targets
    pub fn table_name(&self) -> String {
        self.db.table_for(&self.meta)
    }

    pub fn quoted_table_name(&self) -> String {
        self.dialect().quote(&self.table_name())
    }

    /// Whether the select/omit projection lets this operation write the field
    pub fn changeable(&self, field: &FieldMetadata) -> bool {
        self.db.search.is_changeable(field)
    }

    /// Write a field of the instance. During an update the column is also
    /// added to the written attributes.
    pub fn set_column(&mut self, name: &str, value: JsonValue) -> bool {
        let meta = self.meta.clone();
        let Some(field) = meta.field(name) else {
            return false;
        };
        if let Some(attrs) = self.update_attrs.as_mut() {
            attrs.insert(field.column().to_string(), value.clone());
        }
        field.set(&mut self.value, value);
        true
    }

    /// Run an entity hook on the instance, or on each instance of a sequence
    pub(crate) fn call_hook(&mut self, point: HookPoint) {
        let Some(hook) = self.meta.hooks().get(point).cloned() else {
            return;
        };
        let outcome = match &mut self.value {
            JsonValue::Array(items) => items.iter_mut().try_for_each(|item| hook(item)),
            value => hook(value),
        };
        if let Err(error) = outcome {
            self.add_error(error);
        }
    }

    fn primary_conditions(&self) -> Vec<Condition> {
        if self.many || !self.value.is_object() {
            return Vec::new();
        }
        let dialect = self.dialect();
        let table = self.quoted_table_name();
        self.meta
            .primary_fields()
            .filter(|field| !field.is_blank_in(&self.value))
            .map(|field| {
                Condition::new(
                    format!("{}.{} = ?", table, dialect.quote(field.column())),
                    vec![keys::field_database_value(field, &self.value)],
                )
            })
            .collect()
    }

    /// Whether a write is restricted by a primary key or explicit conditions
    pub(crate) fn has_restriction(&self) -> bool {
        !self.primary_conditions().is_empty() || self.db.search.has_conditions()
    }

    /// Primary key conditions, then search conditions, then the soft-delete
    /// filter unless unscoped
    pub(crate) fn combined_conditions(&self) -> Vec<Condition> {
        let mut conditions = self.primary_conditions();
        conditions.extend(self.db.search.conditions.iter().cloned());
        if !self.db.search.unscoped {
            if let Some(field) = self.meta.field_by_column("deleted_at") {
                conditions.push(Condition::new(
                    format!("{}.{} IS NULL", self.quoted_table_name(), self.dialect().quote(field.column())),
                    Vec::new(),
                ));
            }
        }
        conditions
    }

    /// Render a field name in a select list as a qualified column, leaving
    /// expressions untouched
    fn select_expression(&self, select: &str) -> String {
        match self.meta.field(select) {
            Some(field) if field.is_normal() => {
                format!("{}.{}", self.quoted_table_name(), self.dialect().quote(field.column()))
            }
            _ => select.to_string(),
        }
    }

    pub(crate) fn select_sql(&self) -> (String, Vec<DatabaseValue>) {
        let dialect = self.dialect();
        let search = &self.db.search;
        let table = self.quoted_table_name();

        let mut builder = SqlBuilder::new(dialect);
        builder.push_str("SELECT ");
        if search.selects.is_empty() {
            builder.push_str(&format!("{}.*", table));
        } else {
            let selects: Vec<String> = search.selects.iter().map(|s| self.select_expression(s)).collect();
            builder.push_str(&selects.join(","));
        }
        builder.push_str(" FROM ").push_str(&table);
        for join in &search.joins {
            builder.push_str(" ").push_fragment(&join.sql, &join.args);
        }
        builder.push_where(&self.combined_conditions());
        if !search.orders.is_empty() {
            builder.push_str(" ORDER BY ").push_str(&search.orders.join(","));
        }
        match (search.limit, search.offset) {
            (Some(limit), offset) => {
                builder.push_str(&format!(" LIMIT {}", limit));
                if let Some(offset) = offset {
                    builder.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, Some(offset)) => {
                if dialect == SqlDialect::SQLite {
                    builder.push_str(" LIMIT -1");
                }
                builder.push_str(&format!(" OFFSET {}", offset));
            }
            (None, None) => {}
        }
        builder.finish()
    }
}

/// Copy the columns of a row into the fields of an instance
pub(crate) fn scan_row(meta: &EntityMetadata, row: &dyn DatabaseRow, target: &mut JsonValue) -> ModelResult<()> {
    for (index, column) in row.column_names().iter().enumerate() {
        let Some(field) = meta.field_by_column(column) else {
            continue;
        };
        let Some(kind) = field.scalar_kind() else {
            continue;
        };
        let value = row.get_by_index(index)?;
        field.set(target, value.into_field_json(kind));
    }
    Ok(())
}
