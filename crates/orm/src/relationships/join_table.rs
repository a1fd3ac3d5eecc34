//! Junction tables for many-to-many relationships

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backends::DatabaseValue;
use crate::db::Db;
use crate::error::{ModelError, ModelResult};
use crate::keys::{self, KeyScalar};
use crate::schema::{EntityMetadata, EntityRef};
use crate::search::{Condition, SqlBuilder};

/// A junction column paired with the key column it copies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTableKey {
    /// Column in the junction table
    pub column: String,
    /// Key column on the owning entity
    pub key_column: String,
}

/// One side of a junction table
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTableSide {
    pub entity: EntityRef,
    pub keys: Vec<JoinTableKey>,
}

impl JoinTableSide {
    fn columns(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|key| key.column.as_str())
    }

    /// Key values of one instance, paired with their junction columns
    fn values_of(&self, meta: &EntityMetadata, instance: &JsonValue) -> Vec<(String, DatabaseValue)> {
        self.keys
            .iter()
            .filter_map(|key| {
                meta.field(&key.key_column).map(|field| {
                    (key.column.clone(), keys::field_database_value(field, instance))
                })
            })
            .collect()
    }

    fn key_field_names(&self, meta: &EntityMetadata) -> Vec<String> {
        self.keys
            .iter()
            .filter_map(|key| meta.field(&key.key_column).map(|field| field.name().to_string()))
            .collect()
    }
}

/// Junction table of a many-to-many relationship
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTableDescriptor {
    pub table_name: String,
    pub source: JoinTableSide,
    pub destination: JoinTableSide,
}

impl JoinTableDescriptor {
    /// Pair each side's junction columns with the key columns they reference
    pub fn setup(
        table_name: &str,
        source: EntityRef,
        source_columns: &[String],
        source_key_columns: &[String],
        destination: EntityRef,
        destination_columns: &[String],
        destination_key_columns: &[String],
    ) -> Self {
        let pair = |columns: &[String], key_columns: &[String]| {
            columns
                .iter()
                .zip(key_columns)
                .map(|(column, key_column)| JoinTableKey {
                    column: column.clone(),
                    key_column: key_column.clone(),
                })
                .collect()
        };
        Self {
            table_name: table_name.to_string(),
            source: JoinTableSide {
                entity: source,
                keys: pair(source_columns, source_key_columns),
            },
            destination: JoinTableSide {
                entity: destination,
                keys: pair(destination_columns, destination_key_columns),
            },
        }
    }

    /// Source-side junction columns
    pub fn source_columns(&self) -> Vec<&str> {
        self.source.columns().collect()
    }

    fn side_for(&self, entity: EntityRef) -> Option<&JoinTableSide> {
        if self.source.entity == entity {
            Some(&self.source)
        } else if self.destination.entity == entity {
            Some(&self.destination)
        } else {
            None
        }
    }

    /// Junction column values of each side
    fn search_map(
        &self,
        source_meta: &EntityMetadata,
        source: &JsonValue,
        destination_meta: &EntityMetadata,
        destination: &JsonValue,
    ) -> ModelResult<(Vec<(String, DatabaseValue)>, Vec<(String, DatabaseValue)>)> {
        for (side, meta) in [(&self.source, source_meta), (&self.destination, destination_meta)] {
            if side.entity != meta.entity() {
                return Err(ModelError::Association(format!(
                    "{} is not part of join table {}",
                    meta.type_name(),
                    self.table_name
                )));
            }
        }
        Ok((
            self.source.values_of(source_meta, source),
            self.destination.values_of(destination_meta, destination),
        ))
    }

    /// Insert the link between two records unless it already exists.
    ///
    /// When both sides are the same entity the pair is unordered: linking
    /// `b` to `a` is a no-op once `a` is linked to `b`.
    pub async fn add(
        &self,
        db: &Db,
        source_meta: &EntityMetadata,
        source: &JsonValue,
        destination_meta: &EntityMetadata,
        destination: &JsonValue,
    ) -> ModelResult<()> {
        let (source_values, destination_values) =
            self.search_map(source_meta, source, destination_meta, destination)?;
        if source_values.is_empty() || destination_values.is_empty() {
            return Err(ModelError::Association(format!(
                "no key columns to link in join table {}",
                self.table_name
            )));
        }

        let dialect = db.dialect();
        let table = dialect.quote(&self.table_name);
        let values: Vec<&(String, DatabaseValue)> = source_values.iter().chain(&destination_values).collect();
        let columns: Vec<String> = values.iter().map(|(column, _)| dialect.quote(column)).collect();

        let mut matches = vec![values.iter().map(|(column, value)| (column.as_str(), value)).collect::<Vec<_>>()];
        if self.source.entity == self.destination.entity && source_values.len() == destination_values.len() {
            let swapped = source_values
                .iter()
                .zip(&destination_values)
                .map(|((column, _), (_, value))| (column.as_str(), value))
                .chain(
                    destination_values
                        .iter()
                        .zip(&source_values)
                        .map(|((column, _), (_, value))| (column.as_str(), value)),
                )
                .collect();
            matches.push(swapped);
        }

        let mut builder = SqlBuilder::new(dialect);
        builder.push_str(&format!("INSERT INTO {} ({}) SELECT ", table, columns.join(",")));
        for (index, (_, value)) in values.iter().enumerate() {
            if index > 0 {
                builder.push_str(",");
            }
            builder.bind(value.clone());
        }
        builder.push_str(&format!(" WHERE NOT EXISTS (SELECT * FROM {} WHERE ", table));
        for (index, pairs) in matches.iter().enumerate() {
            if index > 0 {
                builder.push_str(" OR ");
            }
            builder.push_str("(");
            for (position, (column, value)) in pairs.iter().enumerate() {
                if position > 0 {
                    builder.push_str(" AND ");
                }
                builder.push_str(&format!("{} = ", dialect.quote(column)));
                builder.bind((*value).clone());
            }
            builder.push_str(")");
        }
        builder.push_str(")");

        let (sql, args) = builder.finish();
        let inserted = db.execute_raw(&sql, args).await?;
        debug!(table = %self.table_name, inserted, "join table link");
        Ok(())
    }

    /// Delete junction rows matching the handle's conditions, further
    /// restricted to the given records' keys.
    pub async fn delete(&self, db: &Db, sources: &[(&EntityMetadata, &JsonValue)]) -> ModelResult<u64> {
        let dialect = db.dialect();
        let mut builder = SqlBuilder::new(dialect);
        builder
            .push_str("DELETE FROM ")
            .push_str(&dialect.quote(&self.table_name));

        let mut conditions = db.search().conditions.clone();
        for (meta, instance) in sources {
            let side = self.side_for(meta.entity()).ok_or_else(|| {
                ModelError::Association(format!(
                    "{} is not part of join table {}",
                    meta.type_name(),
                    self.table_name
                ))
            })?;
            for (column, value) in side.values_of(meta, instance) {
                conditions.push(Condition::new(
                    format!("{} = ?", dialect.quote(&column)),
                    vec![value],
                ));
            }
        }
        builder.push_where(&conditions);

        let (sql, args) = builder.finish();
        db.execute_raw(&sql, args).await
    }

    /// Restrict a query on the destination table to rows linked with the
    /// given source records. With no source keys the query matches nothing.
    pub fn join_with(&self, db: Db, source_meta: &EntityMetadata, sources: &[&JsonValue]) -> ModelResult<Db> {
        if source_meta.entity() != self.source.entity {
            return Err(ModelError::Association(format!(
                "wrong source type {} for join table {}",
                source_meta.type_name(),
                self.table_name
            )));
        }

        let dialect = db.dialect();
        let table = dialect.quote(&self.table_name);
        let destination_table = db.metadata_of(self.destination.entity).table_name().to_string();
        let destination_table = dialect.quote(&destination_table);

        let join_conditions: Vec<String> = self
            .destination
            .keys
            .iter()
            .map(|key| {
                format!(
                    "{}.{} = {}.{}",
                    table,
                    dialect.quote(&key.column),
                    destination_table,
                    dialect.quote(&key.key_column)
                )
            })
            .collect();
        let db = db.joins(
            &format!("INNER JOIN {} ON {}", table, join_conditions.join(" AND ")),
            Vec::new(),
        );

        let field_names = self.source.key_field_names(source_meta);
        let source_keys = keys::column_values(source_meta, sources.iter().copied(), &field_names);
        if source_keys.is_empty() {
            return Ok(db.where_("1 <> 1", Vec::new()));
        }

        let columns: Vec<String> = self
            .source
            .keys
            .iter()
            .map(|key| format!("{}.{}", table, dialect.quote(&key.column)))
            .collect();
        Ok(db.where_(
            &format!("{} IN (?)", in_target(&columns)),
            vec![keys::keys_to_database_value(&source_keys)],
        ))
    }
}

/// Left side of an `IN` comparison, a row tuple for composite keys
pub(crate) fn in_target(columns: &[String]) -> String {
    if columns.len() == 1 {
        columns[0].clone()
    } else {
        format!("({})", columns.join(","))
    }
}

/// Canonical key assembled from row values
pub(crate) fn canonical_of_values(values: &[DatabaseValue]) -> String {
    let scalars: Vec<KeyScalar> = values.iter().map(|v| KeyScalar::from_json(&v.to_json())).collect();
    keys::canonical_key(&scalars)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::schema::{Entity, EntityDescriptor, ScalarKind};
    use crate::testing::memory_db;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Person {
        id: i64,
        name: String,
        friends: Vec<Person>,
    }

    impl Entity for Person {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Person")
                .field("id", ScalarKind::Int, "")
                .field("name", ScalarKind::Text, "")
                .many::<Person>(
                    "friends",
                    "many2many:friendships;jointable_foreignkey:person_id;association_jointable_foreignkey:friend_id",
                )
        }
    }

    fn person(name: &str) -> Person {
        Person {
            name: name.to_string(),
            ..Default::default()
        }
    }

    async fn link_rows(db: &crate::Db) -> Option<i64> {
        let rows = db
            .query_raw("SELECT count(*) AS n FROM friendships", Vec::new())
            .await
            .unwrap();
        rows[0]["n"].as_i64()
    }

    #[tokio::test]
    async fn test_self_referential_pair_is_linked_once() {
        let db = memory_db().await;
        db.auto_migrate::<Person>().await.unwrap();
        let mut ann = person("ann");
        let mut bob = person("bob");
        db.create(&mut ann).await.unwrap();
        db.create(&mut bob).await.unwrap();

        db.association(&mut ann, "friends").append(vec![bob.clone()]).await.unwrap();
        db.association(&mut ann, "friends").append(vec![bob.clone()]).await.unwrap();
        assert_eq!(link_rows(&db).await, Some(1));

        let ann_again = Person { friends: Vec::new(), ..ann.clone() };
        db.association(&mut bob, "friends").append(vec![ann_again]).await.unwrap();
        assert_eq!(link_rows(&db).await, Some(1));
        assert_eq!(db.association(&mut ann, "friends").count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_distinct_pairs_are_all_linked() {
        let db = memory_db().await;
        db.auto_migrate::<Person>().await.unwrap();
        let mut ann = person("ann");
        db.create(&mut ann).await.unwrap();

        db.association(&mut ann, "friends")
            .append(vec![person("bob"), person("cid")])
            .await
            .unwrap();
        assert_eq!(link_rows(&db).await, Some(2));
        assert_eq!(db.association(&mut ann, "friends").count().await.unwrap(), 2);
    }
}
