//! Additive schema migration
//!
//! Creates missing tables, columns, indexes and junction tables from entity
//! metadata. Existing columns are never altered or dropped.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::backends::{ColumnType, DatabaseValue};
use crate::db::Db;
use crate::error::{ModelError, ModelResult};
use crate::relationships::{JoinTableDescriptor, JoinTableKey, RelationshipKind};
use crate::schema::{Entity, EntityMetadata, FieldMetadata, ScalarKind};

impl Db {
    /// Create or extend the table of `T` and the junction tables of its
    /// many-to-many fields
    pub async fn auto_migrate<T: Entity>(&self) -> ModelResult<()> {
        let meta = self.metadata::<T>();
        self.migrate_entity(&meta).await
    }

    /// Whether a table exists
    pub async fn has_table(&self, table: &str) -> ModelResult<bool> {
        let sql = self.dialect().has_table_sql();
        self.count_matching(&sql, vec![DatabaseValue::from(table)]).await
    }

    /// Whether a column exists on a table
    pub async fn has_column(&self, table: &str, column: &str) -> ModelResult<bool> {
        let sql = self.dialect().has_column_sql();
        self.count_matching(&sql, vec![DatabaseValue::from(table), DatabaseValue::from(column)])
            .await
    }

    async fn count_matching(&self, sql: &str, args: Vec<DatabaseValue>) -> ModelResult<bool> {
        let row = self.fetch_optional_raw(sql, args).await?;
        let count = match row {
            Some(row) => row.get_by_index(0)?.as_i64().unwrap_or(0),
            None => 0,
        };
        Ok(count > 0)
    }

    async fn migrate_entity(&self, meta: &EntityMetadata) -> ModelResult<()> {
        if let Some(error) = meta.resolution_errors().into_iter().next() {
            return Err(error);
        }

        let table = meta.table_name();
        if self.has_table(table).await? {
            for field in meta.fields().iter().filter(|f| f.is_normal()) {
                if !self.has_column(table, field.column()).await? {
                    let sql = format!(
                        "ALTER TABLE {} ADD {} {}",
                        self.dialect().quote(table),
                        self.dialect().quote(field.column()),
                        self.column_definition(field)?
                    );
                    self.execute_raw(&sql, Vec::new()).await?;
                    info!(table, column = field.column(), "added column");
                }
            }
        } else {
            self.create_table(meta).await?;
        }

        self.create_indexes(meta).await?;

        for field in meta.relationship_fields() {
            let Some(relationship) = field.relationship() else {
                continue;
            };
            if relationship.kind != RelationshipKind::ManyToMany {
                continue;
            }
            if let Some(join_table) = &relationship.join_table {
                self.create_join_table(join_table).await?;
            }
        }
        Ok(())
    }

    fn column_type(&self, field: &FieldMetadata) -> ModelResult<ColumnType> {
        let kind = field.scalar_kind().ok_or_else(|| {
            ModelError::Schema(format!("{} is not a column", field.name()))
        })?;
        Ok(ColumnType {
            kind,
            size: field.settings().size(),
            auto_increment: field.is_auto_increment(),
        })
    }

    /// Type and constraints of a column, without the primary key clause
    fn column_definition(&self, field: &FieldMetadata) -> ModelResult<String> {
        let settings = field.settings();
        let mut definition = match settings.value("TYPE") {
            Some(declared) => declared.to_string(),
            None => self.dialect().data_type_of(self.column_type(field)?),
        };
        if settings.has("NOT NULL") {
            definition.push_str(" NOT NULL");
        }
        if settings.has("UNIQUE") {
            definition.push_str(" UNIQUE");
        }
        if let Some(default) = settings.value("DEFAULT") {
            definition.push_str(" DEFAULT ");
            definition.push_str(default);
        }
        Ok(definition)
    }

    async fn create_table(&self, meta: &EntityMetadata) -> ModelResult<()> {
        let dialect = self.dialect();
        let mut columns = Vec::new();
        let mut primary_keys = Vec::new();
        let mut inlined = false;

        for field in meta.fields().iter().filter(|f| f.is_normal()) {
            let column_type = self.column_type(field)?;
            if field.is_primary_key() {
                primary_keys.push(dialect.quote(field.column()));
                inlined |= dialect.inlines_primary_key(column_type);
            }
            columns.push(format!("{} {}", dialect.quote(field.column()), self.column_definition(field)?));
        }
        if !primary_keys.is_empty() && !inlined {
            columns.push(format!("PRIMARY KEY ({})", primary_keys.join(",")));
        }

        let sql = format!("CREATE TABLE {} ({})", dialect.quote(meta.table_name()), columns.join(","));
        self.execute_raw(&sql, Vec::new()).await?;
        info!(table = meta.table_name(), "created table");
        Ok(())
    }

    async fn create_indexes(&self, meta: &EntityMetadata) -> ModelResult<()> {
        let dialect = self.dialect();
        let table = meta.table_name();
        let mut indexes: BTreeMap<(String, bool), Vec<String>> = BTreeMap::new();

        for field in meta.fields().iter().filter(|f| f.is_normal()) {
            let settings = field.settings();
            for (key, unique, prefix) in [("INDEX", false, "idx"), ("UNIQUE_INDEX", true, "uix")] {
                if let Some(name) = settings.get(key) {
                    let name = if name.is_empty() {
                        format!("{}_{}_{}", prefix, table, field.column())
                    } else {
                        name.to_string()
                    };
                    for name in name.split(',') {
                        indexes
                            .entry((name.trim().to_string(), unique))
                            .or_default()
                            .push(dialect.quote(field.column()));
                    }
                }
            }
        }

        for ((name, unique), columns) in indexes {
            let sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if unique { "UNIQUE " } else { "" },
                dialect.quote(&name),
                dialect.quote(table),
                columns.join(",")
            );
            self.execute_raw(&sql, Vec::new()).await?;
            debug!(table, index = %name, "ensured index");
        }
        Ok(())
    }

    async fn create_join_table(&self, join_table: &JoinTableDescriptor) -> ModelResult<()> {
        if self.has_table(&join_table.table_name).await? {
            return Ok(());
        }
        let dialect = self.dialect();
        let mut columns = Vec::new();
        let mut primary_keys = Vec::new();

        for side in [&join_table.source, &join_table.destination] {
            let meta = self.metadata_of(side.entity);
            for key in &side.keys {
                columns.push(format!(
                    "{} {}",
                    dialect.quote(&key.column),
                    self.junction_column_type(&meta, key)?
                ));
                primary_keys.push(dialect.quote(&key.column));
            }
        }
        columns.push(format!("PRIMARY KEY ({})", primary_keys.join(",")));

        let sql = format!("CREATE TABLE {} ({})", dialect.quote(&join_table.table_name), columns.join(","));
        self.execute_raw(&sql, Vec::new()).await?;
        info!(table = %join_table.table_name, "created join table");
        Ok(())
    }

    /// A junction column copies the referenced key's type without its
    /// auto-increment
    fn junction_column_type(&self, meta: &EntityMetadata, key: &JoinTableKey) -> ModelResult<String> {
        let field = meta.field_by_column(&key.key_column).ok_or_else(|| {
            ModelError::Schema(format!("{} has no column {}", meta.type_name(), key.key_column))
        })?;
        if let Some(declared) = field.settings().value("TYPE") {
            return Ok(declared.to_string());
        }
        let mut column_type = self.column_type(field)?;
        column_type.auto_increment = false;
        if column_type.kind == ScalarKind::Text && column_type.size.is_none() {
            column_type.size = Some(255);
        }
        Ok(self.dialect().data_type_of(column_type))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::schema::{Entity, EntityDescriptor, ScalarKind};
    use crate::testing::memory_db;

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Tag {
        id: i64,
        label: String,
    }

    impl Entity for Tag {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Tag")
                .field("id", ScalarKind::Int, "")
                .field("label", ScalarKind::Text, "size:32;unique_index")
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Article {
        id: i64,
        title: String,
        tags: Vec<Tag>,
    }

    impl Entity for Article {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Article")
                .field("id", ScalarKind::Int, "")
                .field("title", ScalarKind::Text, "not null;default:'untitled'")
                .many::<Tag>("tags", "many2many:article_tags")
        }
    }

    #[tokio::test]
    async fn test_creates_tables_and_join_table() {
        let db = memory_db().await;
        db.auto_migrate::<Article>().await.unwrap();

        assert!(db.has_table("articles").await.unwrap());
        assert!(db.has_table("article_tags").await.unwrap());
        assert!(db.has_column("article_tags", "article_id").await.unwrap());
        assert!(db.has_column("article_tags", "tag_id").await.unwrap());
        assert!(!db.has_table("tags").await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_is_repeatable() {
        let db = memory_db().await;
        db.auto_migrate::<Tag>().await.unwrap();
        db.auto_migrate::<Tag>().await.unwrap();

        let rows = db
            .query_raw("SELECT count(*) AS n FROM sqlite_master WHERE type = 'index' AND name = ?", vec!["uix_tags_label".into()])
            .await
            .unwrap();
        assert_eq!(rows[0]["n"].as_i64(), Some(1));
    }

    #[tokio::test]
    async fn test_adds_missing_columns() {
        let db = memory_db().await;
        db.exec("CREATE TABLE tags (id integer primary key autoincrement)", Vec::new())
            .await
            .unwrap();
        assert!(!db.has_column("tags", "label").await.unwrap());

        db.auto_migrate::<Tag>().await.unwrap();
        assert!(db.has_column("tags", "label").await.unwrap());
    }
}
