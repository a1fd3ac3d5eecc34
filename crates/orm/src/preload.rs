//! Eager loading
//!
//! Each dotted preload path is walked one segment at a time. A segment is
//! loaded with one batched `IN (...)` query over the distinct keys of every
//! record at that level, and the results are attributed back to their owners
//! by canonical key. The loaded records become the owners of the next
//! segment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backends::DatabaseValue;
use crate::db::Db;
use crate::error::{ModelError, ModelResult};
use crate::keys::{self, KeyScalar};
use crate::relationships::join_table::{canonical_of_values, in_target};
use crate::relationships::{RelationshipDescriptor, RelationshipKind};
use crate::schema::{EntityMetadata, FieldMetadata, HookPoint};
use crate::scope::{scan_row, Scope};
use crate::search::{Condition, PreloadCustomizer};

/// Prefix of the junction key aliases selected by many-to-many preloads
const JOIN_ALIAS_PREFIX: &str = "__join_";

/// Load every preload path requested on the scope's handle into its value
pub(crate) async fn preload(scope: &mut Scope) -> ModelResult<()> {
    let specs = scope.db.search.preloads.clone();
    let root_meta = scope.metadata().clone();
    let db = scope.db.new_session();
    let batch_size = db.config().preload.max_batch_size.max(1);
    let mut preloaded = HashSet::new();

    for spec in &specs {
        let segments: Vec<&str> = spec.path.split('.').filter(|s| !s.is_empty()).collect();
        let mut meta = root_meta.clone();
        let mut records: Vec<&mut JsonValue> = match &mut scope.value {
            JsonValue::Array(items) => items.iter_mut().collect(),
            JsonValue::Null => Vec::new(),
            value => vec![value],
        };

        for (depth, segment) in segments.iter().enumerate() {
            let field = meta
                .field(segment)
                .filter(|field| field.relationship().is_some())
                .ok_or_else(|| {
                    ModelError::Query(format!("can't preload field {} for {}", segment, meta.type_name()))
                })?;
            let relationship = field.relationship().ok_or_else(|| {
                ModelError::Query(format!("can't preload field {} for {}", segment, meta.type_name()))
            })?;
            let target = db.metadata_of(relationship.target);

            let path = segments[..=depth].join(".");
            if preloaded.insert(path.clone()) {
                let last = depth + 1 == segments.len();
                let (conditions, customize) = if last {
                    (spec.conditions.as_slice(), spec.customize.as_ref())
                } else {
                    (&[][..], None)
                };
                let query = related_query(&db, conditions, customize);
                debug!(path = %path, kind = %relationship.kind, owners = records.len(), "preloading");

                let loader = Loader {
                    query,
                    owner: &meta,
                    field,
                    relationship,
                    target: &target,
                    batch_size,
                };
                match relationship.kind {
                    RelationshipKind::HasOne => loader.has_one(&mut records).await?,
                    RelationshipKind::HasMany => loader.has_many(&mut records).await?,
                    RelationshipKind::BelongsTo => loader.belongs_to(&mut records).await?,
                    RelationshipKind::ManyToMany => loader.many_to_many(&mut records).await?,
                }
            }

            if depth + 1 < segments.len() {
                records = records
                    .into_iter()
                    .flat_map(|record| children_mut(field, record))
                    .collect();
                meta = target;
            }
        }
    }
    Ok(())
}

fn related_query(db: &Db, conditions: &[Condition], customize: Option<&PreloadCustomizer>) -> Db {
    let mut query = db.new_session();
    query.search.conditions.extend(conditions.iter().cloned());
    match customize {
        Some(customize) => customize(query),
        None => query,
    }
}

/// Related records held by a field of one owner
fn children_mut<'v>(field: &FieldMetadata, record: &'v mut JsonValue) -> Vec<&'v mut JsonValue> {
    match field.get_mut(record) {
        Some(JsonValue::Array(items)) => items.iter_mut().collect(),
        Some(value @ JsonValue::Object(_)) => vec![value],
        _ => Vec::new(),
    }
}

struct Loader<'a> {
    query: Db,
    owner: &'a EntityMetadata,
    field: &'a FieldMetadata,
    relationship: &'a RelationshipDescriptor,
    target: &'a Arc<EntityMetadata>,
    batch_size: usize,
}

impl Loader<'_> {
    /// Related rows whose `columns` match one of `keys`, in batches
    async fn fetch_in(&self, columns: &[String], keys: &[Vec<KeyScalar>]) -> ModelResult<Vec<JsonValue>> {
        let dialect = self.query.dialect();
        let table = dialect.quote(&self.query.table_for(self.target));
        let qualified: Vec<String> = columns
            .iter()
            .map(|column| format!("{}.{}", table, dialect.quote(column)))
            .collect();
        let target_expr = in_target(&qualified);

        let mut results = Vec::new();
        for chunk in keys.chunks(self.batch_size) {
            let mut query = self
                .query
                .clone()
                .where_(&format!("{} IN (?)", target_expr), vec![keys::keys_to_database_value(chunk)]);
            if let Some((column, value)) = self.relationship.polymorphic_condition() {
                query = query.where_(
                    &format!("{}.{} = ?", table, dialect.quote(column)),
                    vec![DatabaseValue::from(value)],
                );
            }
            results.extend(query.find_values(self.target.clone()).await?);
        }
        Ok(results)
    }

    fn owner_keys(&self, records: &[&mut JsonValue], field_names: &[String]) -> Vec<Vec<KeyScalar>> {
        keys::column_values(self.owner, records.iter().map(|r| &**r), field_names)
    }

    fn owner_key(&self, record: &JsonValue, field_names: &[String]) -> String {
        keys::canonical_key(&keys::key_of(self.owner, record, field_names))
    }

    fn result_key(&self, result: &JsonValue, field_names: &[String]) -> String {
        keys::canonical_key(&keys::key_of(self.target, result, field_names))
    }

    async fn has_one(&self, records: &mut [&mut JsonValue]) -> ModelResult<()> {
        let relationship = self.relationship;
        let keys = self.owner_keys(records, &relationship.association_foreign_field_names);
        if keys.is_empty() {
            return Ok(());
        }
        let results = self.fetch_in(&relationship.foreign_db_names, &keys).await?;

        let mut by_key = HashMap::new();
        for result in results {
            by_key.insert(self.result_key(&result, &relationship.foreign_field_names), result);
        }
        for record in records.iter_mut() {
            let key = self.owner_key(record, &relationship.association_foreign_field_names);
            if let Some(result) = by_key.get(&key) {
                self.field.set(record, result.clone());
            }
        }
        Ok(())
    }

    async fn has_many(&self, records: &mut [&mut JsonValue]) -> ModelResult<()> {
        let relationship = self.relationship;
        let keys = self.owner_keys(records, &relationship.association_foreign_field_names);
        let results = if keys.is_empty() {
            Vec::new()
        } else {
            self.fetch_in(&relationship.foreign_db_names, &keys).await?
        };

        let mut groups: HashMap<String, Vec<JsonValue>> = HashMap::new();
        for result in results {
            groups
                .entry(self.result_key(&result, &relationship.foreign_field_names))
                .or_default()
                .push(result);
        }
        for record in records.iter_mut() {
            let key = self.owner_key(record, &relationship.association_foreign_field_names);
            let matched = groups.get(&key).cloned().unwrap_or_default();
            self.field.set(record, JsonValue::Array(matched));
        }
        Ok(())
    }

    async fn belongs_to(&self, records: &mut [&mut JsonValue]) -> ModelResult<()> {
        let relationship = self.relationship;
        let keys = self.owner_keys(records, &relationship.foreign_field_names);
        if keys.is_empty() {
            return Ok(());
        }
        let results = self.fetch_in(&relationship.association_foreign_db_names, &keys).await?;

        let mut by_key = HashMap::new();
        for result in results {
            by_key.insert(self.result_key(&result, &relationship.association_foreign_field_names), result);
        }
        for record in records.iter_mut() {
            let key = self.owner_key(record, &relationship.foreign_field_names);
            if let Some(result) = by_key.get(&key) {
                self.field.set(record, result.clone());
            }
        }
        Ok(())
    }

    /// Junction key columns are selected under an alias so each related row
    /// can be attributed to its owner
    async fn many_to_many(&self, records: &mut [&mut JsonValue]) -> ModelResult<()> {
        let relationship = self.relationship;
        let join_table = relationship.join_table.as_ref().ok_or_else(|| {
            ModelError::Relationship(format!("{} has no join table", self.field.name()))
        })?;
        let dialect = self.query.dialect();
        let table = dialect.quote(&self.query.table_for(self.target));
        let junction = dialect.quote(&join_table.table_name);

        let mut selects = vec![format!("{}.*", table)];
        for key in &join_table.source.keys {
            selects.push(format!(
                "{}.{} AS {}",
                junction,
                dialect.quote(&key.column),
                dialect.quote(&format!("{}{}", JOIN_ALIAS_PREFIX, key.column))
            ));
        }

        let owners: Vec<&JsonValue> = records.iter().map(|r| &**r).collect();
        let mut groups: HashMap<String, Vec<JsonValue>> = HashMap::new();
        let after_find = self.target.hooks().get(HookPoint::AfterFind).cloned();

        for chunk in owners.chunks(self.batch_size) {
            let mut query = join_table.join_with(self.query.clone(), self.owner, chunk)?;
            query.search.selects = selects.clone();
            let rows = query.rows_value(self.target.clone()).await?;

            for row in rows {
                let mut instance = self.target.blank_instance();
                scan_row(self.target, row.as_ref(), &mut instance)?;
                if let Some(hook) = &after_find {
                    hook(&mut instance)?;
                }
                let mut join_values = Vec::with_capacity(join_table.source.keys.len());
                for key in &join_table.source.keys {
                    join_values.push(row.get_by_name(&format!("{}{}", JOIN_ALIAS_PREFIX, key.column))?);
                }
                groups
                    .entry(canonical_of_values(&join_values))
                    .or_default()
                    .push(instance);
            }
        }

        for record in records.iter_mut() {
            let key = self.owner_key(record, &relationship.foreign_field_names);
            let matched = groups.get(&key).cloned().unwrap_or_default();
            self.field.set(record, JsonValue::Array(matched));
        }
        Ok(())
    }
}
