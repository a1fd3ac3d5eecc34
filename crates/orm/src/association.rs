//! Association handles
//!
//! An [`Association`] scopes find, append, replace, delete, clear and count to
//! one relationship field of one source instance. Every change is written
//! back into the source. The first failure is kept on the handle and returned
//! by every later call.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::backends::DatabaseValue;
use crate::db::Db;
use crate::error::{ModelError, ModelResult};
use crate::keys::{self, KeyScalar};
use crate::relationships::join_table::in_target;
use crate::relationships::{RelationshipDescriptor, RelationshipKind};
use crate::schema::entity::{decode, encode};
use crate::schema::{Entity, EntityMetadata, EntityRef, FieldMetadata};

impl Db {
    /// Handle on the relationship `field` of `source`
    pub fn association<'s, S: Entity>(&self, source: &'s mut S, field: &str) -> Association<'s, S> {
        let meta = self.metadata::<S>();
        let mut error = None;
        let value = match encode(&*source) {
            Ok(value) => value,
            Err(e) => {
                error = Some(e);
                JsonValue::Null
            }
        };
        if error.is_none() && meta.field(field).and_then(FieldMetadata::relationship).is_none() {
            error = Some(ModelError::Association(format!(
                "invalid association {} for {}",
                field,
                meta.type_name()
            )));
        }
        Association {
            db: self.clone(),
            source,
            value,
            meta,
            field_name: field.to_string(),
            error,
        }
    }
}

/// Relation-scoped operations on one field of one instance
pub struct Association<'s, S: Entity> {
    db: Db,
    source: &'s mut S,
    value: JsonValue,
    meta: Arc<EntityMetadata>,
    field_name: String,
    error: Option<ModelError>,
}

impl<S: Entity> Association<'_, S> {
    /// The failure recorded on this handle, if any
    pub fn error(&self) -> Option<&ModelError> {
        self.error.as_ref()
    }

    fn check(&self) -> ModelResult<()> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Record the first failure and return it
    fn fail<R>(&mut self, error: ModelError) -> ModelResult<R> {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        Err(error)
    }

    fn settle<R>(&mut self, outcome: ModelResult<R>) -> ModelResult<R> {
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => self.fail(error),
        }
    }

    fn field(&self) -> ModelResult<&FieldMetadata> {
        self.meta
            .field(&self.field_name)
            .ok_or_else(|| ModelError::Association(format!("unknown field {}", self.field_name)))
    }

    fn relationship(&self) -> ModelResult<&RelationshipDescriptor> {
        self.field()?
            .relationship()
            .ok_or_else(|| ModelError::Association(format!("{} is not a relationship", self.field_name)))
    }

    fn target_meta(&self) -> ModelResult<Arc<EntityMetadata>> {
        Ok(self.db.metadata_of(self.relationship()?.target))
    }

    fn check_type<T: Entity>(&self) -> ModelResult<()> {
        let target = self.relationship()?.target;
        if EntityRef::of::<T>() != target {
            return Err(ModelError::Association(format!(
                "{}.{} holds {}, not {}",
                self.meta.type_name(),
                self.field_name,
                target.rust_name(),
                std::any::type_name::<T>()
            )));
        }
        Ok(())
    }

    fn write_back(&mut self) -> ModelResult<()> {
        *self.source = decode(self.value.clone())?;
        Ok(())
    }

    fn source_keys(&self, field_names: &[String]) -> Vec<Vec<KeyScalar>> {
        keys::column_values(&self.meta, [&self.value], field_names)
    }

    /// Query on the related table restricted to this source's links, `None`
    /// when the source has no keys to restrict by
    fn restrict(&self) -> ModelResult<Option<Db>> {
        let relationship = self.relationship()?;
        let target = self.target_meta()?;
        let dialect = self.db.dialect();
        let table = dialect.quote(target.table_name());
        let qualify = |columns: &[String]| -> Vec<String> {
            columns
                .iter()
                .map(|column| format!("{}.{}", table, dialect.quote(column)))
                .collect()
        };

        let query = match relationship.kind {
            RelationshipKind::HasOne | RelationshipKind::HasMany => {
                let keys = self.source_keys(&relationship.association_foreign_field_names);
                if keys.is_empty() {
                    return Ok(None);
                }
                let mut query = self.db.clone().where_(
                    &format!("{} IN (?)", in_target(&qualify(&relationship.foreign_db_names))),
                    vec![keys::keys_to_database_value(&keys)],
                );
                if let Some((column, value)) = relationship.polymorphic_condition() {
                    query = query.where_(
                        &format!("{}.{} = ?", table, dialect.quote(column)),
                        vec![DatabaseValue::from(value)],
                    );
                }
                query
            }
            RelationshipKind::BelongsTo => {
                let keys = self.source_keys(&relationship.foreign_field_names);
                if keys.is_empty() {
                    return Ok(None);
                }
                self.db.clone().where_(
                    &format!("{} IN (?)", in_target(&qualify(&relationship.association_foreign_db_names))),
                    vec![keys::keys_to_database_value(&keys)],
                )
            }
            RelationshipKind::ManyToMany => {
                let join_table = relationship
                    .join_table
                    .as_ref()
                    .ok_or_else(|| ModelError::Association(format!("{} has no join table", self.field_name)))?;
                if self.source_keys(&relationship.foreign_field_names).is_empty() {
                    return Ok(None);
                }
                join_table.join_with(self.db.clone(), &self.meta, &[&self.value])?
            }
        };
        Ok(Some(query))
    }

    /// Related records of the source
    pub async fn find<T: Entity>(&mut self) -> ModelResult<Vec<T>> {
        self.check()?;
        let outcome = self.find_inner::<T>().await;
        self.settle(outcome)
    }

    async fn find_inner<T: Entity>(&self) -> ModelResult<Vec<T>> {
        self.check_type::<T>()?;
        let Some(query) = self.restrict()? else {
            return Ok(Vec::new());
        };
        let target = self.target_meta()?;
        query.find_values(target).await?.into_iter().map(decode).collect()
    }

    /// Number of related records; zero without a query when the source has no
    /// keys yet
    pub async fn count(&mut self) -> ModelResult<i64> {
        self.check()?;
        let outcome = match self.restrict() {
            Ok(Some(query)) => match self.target_meta() {
                Ok(target) => query.count_value(target).await,
                Err(error) => Err(error),
            },
            Ok(None) => Ok(0),
            Err(error) => Err(error),
        };
        self.settle(outcome)
    }

    /// Save and link values. For has-one and belongs-to this replaces the
    /// current value.
    pub async fn append<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check()?;
        let kind = match self.relationship() {
            Ok(relationship) => relationship.kind,
            Err(error) => return self.fail(error),
        };
        if matches!(kind, RelationshipKind::HasOne | RelationshipKind::BelongsTo) {
            return self.replace(values).await;
        }
        let outcome = self.save_values(values).await;
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: ModelResult<()>) -> ModelResult<()> {
        let outcome = outcome.and_then(|_| self.write_back());
        self.settle(outcome)
    }

    async fn save_values<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check_type::<T>()?;
        let meta = self.meta.clone();
        let field = meta
            .field(&self.field_name)
            .ok_or_else(|| ModelError::Association(format!("unknown field {}", self.field_name)))?;
        let relationship = self.relationship()?.clone();
        let target = self.target_meta()?;

        for value in values {
            let mut item = encode(&value)?;
            if relationship.kind == RelationshipKind::ManyToMany && target.primary_key_zero(&item) {
                self.db.new_session().save_value(target.clone(), &mut item).await?;
            }

            let linked = item.clone();
            if field.is_many() {
                match field.get_mut(&mut self.value) {
                    Some(JsonValue::Array(items)) => items.push(item),
                    Some(slot) => *slot = JsonValue::Array(vec![item]),
                    None => {}
                }
            } else {
                field.set(&mut self.value, item);
            }

            match &relationship.join_table {
                Some(join_table) if relationship.kind == RelationshipKind::ManyToMany => {
                    join_table
                        .add(&self.db.new_session(), &meta, &self.value, &target, &linked)
                        .await?;
                }
                _ => {
                    self.db
                        .new_session()
                        .select([self.field_name.clone()])
                        .save_value(meta.clone(), &mut self.value)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Link exactly these values, unlinking everything else
    pub async fn replace<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check()?;
        let outcome = self.replace_inner(values).await;
        self.finish(outcome)
    }

    async fn replace_inner<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check_type::<T>()?;
        self.empty_field()?;
        self.save_values(values).await?;
        self.unlink_others().await
    }

    fn empty_field(&mut self) -> ModelResult<()> {
        let meta = self.meta.clone();
        let field = meta
            .field(&self.field_name)
            .ok_or_else(|| ModelError::Association(format!("unknown field {}", self.field_name)))?;
        let empty = if field.is_many() { JsonValue::Array(Vec::new()) } else { JsonValue::Null };
        field.set(&mut self.value, empty);
        Ok(())
    }

    /// Unlink every related record not currently held in the source field
    async fn unlink_others(&mut self) -> ModelResult<()> {
        let meta = self.meta.clone();
        let field = meta
            .field(&self.field_name)
            .ok_or_else(|| ModelError::Association(format!("unknown field {}", self.field_name)))?;
        let relationship = self.relationship()?.clone();
        let target = self.target_meta()?;
        let dialect = self.db.dialect();
        let holding = !related_instances(field.get(&self.value)).is_empty();

        if relationship.kind == RelationshipKind::BelongsTo {
            if !holding && !meta.primary_key_zero(&self.value) {
                let nulls = null_columns(&relationship.foreign_db_names);
                self.db
                    .new_session()
                    .update_columns_value(meta.clone(), &mut self.value, nulls)
                    .await?;
            }
            return Ok(());
        }

        let mut query = self.db.new_session();
        if let Some((column, value)) = relationship.polymorphic_condition() {
            query = query.where_(&format!("{} = ?", dialect.quote(column)), vec![DatabaseValue::from(value)]);
        }

        if holding {
            let (field_names, db_names): (Vec<String>, Vec<String>) = if relationship.kind == RelationshipKind::ManyToMany {
                (
                    relationship.association_foreign_field_names.clone(),
                    relationship.association_foreign_db_names.clone(),
                )
            } else {
                target
                    .primary_fields()
                    .map(|f| (f.name().to_string(), f.column().to_string()))
                    .unzip()
            };
            let kept = keys::column_values(&target, related_instances(field.get(&self.value)), &field_names);
            if !kept.is_empty() {
                let columns: Vec<String> = db_names.iter().map(|c| dialect.quote(c)).collect();
                query = query.where_(
                    &format!("{} NOT IN (?)", in_target(&columns)),
                    vec![keys::keys_to_database_value(&kept)],
                );
            }
        }

        match relationship.kind {
            RelationshipKind::ManyToMany => {
                if self.source_keys(&relationship.foreign_field_names).is_empty() {
                    return Ok(());
                }
                if let Some(join_table) = &relationship.join_table {
                    join_table.delete(&query, &[(&meta, &self.value)]).await?;
                }
            }
            _ => {
                for (foreign, association) in relationship
                    .foreign_db_names
                    .iter()
                    .zip(&relationship.association_foreign_field_names)
                {
                    let Some(source_field) = meta.field(association) else {
                        continue;
                    };
                    if source_field.is_blank_in(&self.value) {
                        return Ok(());
                    }
                    query = query.where_(
                        &format!("{} = ?", dialect.quote(foreign)),
                        vec![keys::field_database_value(source_field, &self.value)],
                    );
                }
                let mut blank = target.blank_instance();
                query
                    .update_columns_value(target.clone(), &mut blank, null_columns(&relationship.foreign_db_names))
                    .await?;
            }
        }
        Ok(())
    }

    /// Unlink these values without deleting their rows, and drop them from
    /// the source field
    pub async fn delete<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check()?;
        if values.is_empty() {
            return Ok(());
        }
        let outcome = self.delete_inner(values).await;
        self.finish(outcome)
    }

    async fn delete_inner<T: Entity>(&mut self, values: Vec<T>) -> ModelResult<()> {
        self.check_type::<T>()?;
        let meta = self.meta.clone();
        let field = meta
            .field(&self.field_name)
            .ok_or_else(|| ModelError::Association(format!("unknown field {}", self.field_name)))?;
        let relationship = self.relationship()?.clone();
        let target = self.target_meta()?;
        let dialect = self.db.dialect();

        let deleting: Vec<JsonValue> = values.iter().map(encode).collect::<ModelResult<_>>()?;
        let primary_names: Vec<String> = target.primary_fields().map(|f| f.name().to_string()).collect();
        let primary_columns: Vec<String> = target.primary_fields().map(|f| dialect.quote(f.column())).collect();
        let deleting_keys = keys::column_values(&target, deleting.iter(), &primary_names);

        match relationship.kind {
            RelationshipKind::ManyToMany => {
                let keys = keys::column_values(&target, deleting.iter(), &relationship.association_foreign_field_names);
                if let (Some(join_table), false) = (&relationship.join_table, keys.is_empty()) {
                    let columns: Vec<String> = relationship
                        .association_foreign_db_names
                        .iter()
                        .map(|c| dialect.quote(c))
                        .collect();
                    let query = self.db.new_session().where_(
                        &format!("{} IN (?)", in_target(&columns)),
                        vec![keys::keys_to_database_value(&keys)],
                    );
                    join_table.delete(&query, &[(&meta, &self.value)]).await?;
                }
            }
            RelationshipKind::BelongsTo => {
                let keys = keys::column_values(&target, deleting.iter(), &relationship.association_foreign_field_names);
                if !keys.is_empty() && !meta.primary_key_zero(&self.value) {
                    let columns: Vec<String> = relationship.foreign_db_names.iter().map(|c| dialect.quote(c)).collect();
                    let mut updated = self.value.clone();
                    let affected = self
                        .db
                        .new_session()
                        .where_(
                            &format!("{} IN (?)", in_target(&columns)),
                            vec![keys::keys_to_database_value(&keys)],
                        )
                        .update_columns_value(meta.clone(), &mut updated, null_columns(&relationship.foreign_db_names))
                        .await?;
                    if affected > 0 {
                        self.value = updated;
                    }
                }
            }
            RelationshipKind::HasOne | RelationshipKind::HasMany => {
                let source_keys = self.source_keys(&relationship.association_foreign_field_names);
                if !source_keys.is_empty() && !deleting_keys.is_empty() {
                    let foreign: Vec<String> = relationship.foreign_db_names.iter().map(|c| dialect.quote(c)).collect();
                    let mut blank = target.blank_instance();
                    self.db
                        .new_session()
                        .where_(
                            &format!("{} IN (?)", in_target(&foreign)),
                            vec![keys::keys_to_database_value(&source_keys)],
                        )
                        .where_(
                            &format!("{} IN (?)", in_target(&primary_columns)),
                            vec![keys::keys_to_database_value(&deleting_keys)],
                        )
                        .update_columns_value(target.clone(), &mut blank, null_columns(&relationship.foreign_db_names))
                        .await?;
                }
            }
        }

        let removed: HashSet<String> = deleting_keys.iter().map(|k| keys::canonical_key(k)).collect();
        let is_removed = |item: &JsonValue| removed.contains(&keys::canonical_key(&keys::key_of(&target, item, &primary_names)));
        if let Some(slot) = field.get_mut(&mut self.value) {
            match slot {
                JsonValue::Array(items) => items.retain(|item| !is_removed(item)),
                JsonValue::Object(_) => {
                    if is_removed(slot) {
                        *slot = JsonValue::Null;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Unlink every related record. Same as [`Association::replace`] with no
    /// values, without naming the related type.
    pub async fn clear(&mut self) -> ModelResult<()> {
        self.check()?;
        if let Err(error) = self.relationship() {
            return self.fail(error);
        }
        let outcome = match self.empty_field() {
            Ok(()) => self.unlink_others().await,
            Err(error) => Err(error),
        };
        self.finish(outcome)
    }
}

fn null_columns(columns: &[String]) -> Map<String, JsonValue> {
    columns.iter().map(|c| (c.clone(), JsonValue::Null)).collect()
}

fn related_instances(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}
