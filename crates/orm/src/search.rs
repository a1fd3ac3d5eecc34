//! Per-handle query state and SQL fragment rendering
//!
//! A [`Search`] accumulates conditions, joins, ordering and projections on a
//! [`Db`](crate::Db) handle. Condition fragments use `?` for arguments; the
//! [`SqlBuilder`] rewrites them into the dialect's placeholders while
//! rendering a statement.

use std::fmt;
use std::sync::Arc;

use crate::backends::{DatabaseValue, SqlDialect};
use crate::db::Db;
use crate::schema::FieldMetadata;

/// A SQL fragment with `?` argument markers
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub args: Vec<DatabaseValue>,
}

impl Condition {
    pub fn new(sql: impl Into<String>, args: Vec<DatabaseValue>) -> Self {
        Self { sql: sql.into(), args }
    }
}

/// Function adjusting the query used to load one preload path
pub type PreloadCustomizer = Arc<dyn Fn(Db) -> Db + Send + Sync>;

/// A dotted relationship path to eager-load, with optional filters
#[derive(Clone)]
pub struct PreloadSpec {
    pub(crate) path: String,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) customize: Option<PreloadCustomizer>,
}

impl PreloadSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conditions: Vec::new(),
            customize: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for PreloadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadSpec")
            .field("path", &self.path)
            .field("conditions", &self.conditions)
            .field("customize", &self.customize.is_some())
            .finish()
    }
}

/// Query state carried by a handle. Cloning copies every list, so a derived
/// handle never changes the conditions of the one it came from.
#[derive(Debug, Clone, Default)]
pub struct Search {
    pub(crate) conditions: Vec<Condition>,
    pub(crate) joins: Vec<Condition>,
    pub(crate) orders: Vec<String>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) selects: Vec<String>,
    pub(crate) omits: Vec<String>,
    pub(crate) preloads: Vec<PreloadSpec>,
    pub(crate) table: Option<String>,
    pub(crate) unscoped: bool,
}

impl Search {
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn preloads(&self) -> &[PreloadSpec] {
        &self.preloads
    }

    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }

    /// Whether a save may write this field under the select/omit projection
    pub fn is_changeable(&self, field: &FieldMetadata) -> bool {
        let named = |list: &[String]| {
            list.iter()
                .any(|name| name == field.name() || name == field.column())
        };
        if !self.selects.is_empty() {
            return named(&self.selects);
        }
        !named(&self.omits)
    }
}

/// Statement under construction
pub(crate) struct SqlBuilder {
    dialect: SqlDialect,
    sql: String,
    args: Vec<DatabaseValue>,
}

impl SqlBuilder {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            args: Vec::new(),
        }
    }

    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Append one bound value. Nulls render as `NULL`; arrays expand into a
    /// comma list, with nested arrays rendered as row tuples.
    pub fn bind(&mut self, value: DatabaseValue) -> &mut Self {
        match value {
            DatabaseValue::Null => self.sql.push_str("NULL"),
            DatabaseValue::Array(items) if items.is_empty() => self.sql.push_str("NULL"),
            DatabaseValue::Array(items) => {
                for (index, item) in items.into_iter().enumerate() {
                    if index > 0 {
                        self.sql.push(',');
                    }
                    match item {
                        DatabaseValue::Array(tuple) => {
                            self.sql.push('(');
                            for (i, part) in tuple.into_iter().enumerate() {
                                if i > 0 {
                                    self.sql.push(',');
                                }
                                self.bind(part);
                            }
                            self.sql.push(')');
                        }
                        scalar => {
                            self.bind(scalar);
                        }
                    }
                }
            }
            scalar => {
                let placeholder = self.dialect.parameter_placeholder(self.args.len());
                self.sql.push_str(&placeholder);
                self.args.push(scalar);
            }
        }
        self
    }

    /// Append a fragment, replacing each `?` outside quotes with the next argument
    pub fn push_fragment(&mut self, fragment: &str, args: &[DatabaseValue]) -> &mut Self {
        let mut args = args.iter().cloned();
        let mut in_single = false;
        let mut in_double = false;
        for c in fragment.chars() {
            match c {
                '\'' if !in_double => {
                    in_single = !in_single;
                    self.sql.push(c);
                }
                '"' if !in_single => {
                    in_double = !in_double;
                    self.sql.push(c);
                }
                '?' if !in_single && !in_double => match args.next() {
                    Some(arg) => {
                        self.bind(arg);
                    }
                    None => self.sql.push('?'),
                },
                other => self.sql.push(other),
            }
        }
        self
    }

    /// Append ` WHERE (..) AND (..)` when any condition is present
    pub fn push_where(&mut self, conditions: &[Condition]) -> &mut Self {
        for (index, condition) in conditions.iter().enumerate() {
            self.sql.push_str(if index == 0 { " WHERE (" } else { " AND (" });
            self.push_fragment(&condition.sql, &condition.args);
            self.sql.push(')');
        }
        self
    }

    pub fn finish(self) -> (String, Vec<DatabaseValue>) {
        (self.sql, self.args)
    }
}

/// Render a single fragment into dialect SQL
pub(crate) fn render(dialect: SqlDialect, fragment: &str, args: &[DatabaseValue]) -> (String, Vec<DatabaseValue>) {
    let mut builder = SqlBuilder::new(dialect);
    builder.push_fragment(fragment, args);
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_numbered_for_postgres() {
        let (sql, args) = render(
            SqlDialect::PostgreSQL,
            "name = ? AND age > ?",
            &["bob".into(), DatabaseValue::Int64(3)],
        );
        assert_eq!(sql, "name = $1 AND age > $2");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_quoted_question_marks_are_kept() {
        let (sql, args) = render(SqlDialect::SQLite, "note = '?' AND id = ?", &[DatabaseValue::Int64(1)]);
        assert_eq!(sql, "note = '?' AND id = ?");
        assert_eq!(args, vec![DatabaseValue::Int64(1)]);
    }

    #[test]
    fn test_arrays_and_nulls() {
        let keys = DatabaseValue::Array(vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)]);
        let (sql, args) = render(SqlDialect::PostgreSQL, "id IN (?) AND x = ?", &[keys, DatabaseValue::Null]);
        assert_eq!(sql, "id IN ($1,$2) AND x = NULL");
        assert_eq!(args.len(), 2);

        let tuples = DatabaseValue::Array(vec![
            DatabaseValue::Array(vec![1i64.into(), "a".into()]),
            DatabaseValue::Array(vec![2i64.into(), "b".into()]),
        ]);
        let (sql, _) = render(SqlDialect::SQLite, "(id,kind) IN (?)", &[tuples]);
        assert_eq!(sql, "(id,kind) IN ((?,?),(?,?))");

        let (sql, args) = render(SqlDialect::SQLite, "id IN (?)", &[DatabaseValue::Array(vec![])]);
        assert_eq!(sql, "id IN (NULL)");
        assert!(args.is_empty());
    }

    #[test]
    fn test_where_clause() {
        let mut builder = SqlBuilder::new(SqlDialect::PostgreSQL);
        builder.push_str("SELECT * FROM t").push_where(&[
            Condition::new("a = ?", vec![1i64.into()]),
            Condition::new("b IS NULL", vec![]),
        ]);
        let (sql, _) = builder.finish();
        assert_eq!(sql, "SELECT * FROM t WHERE (a = $1) AND (b IS NULL)");
    }
}
