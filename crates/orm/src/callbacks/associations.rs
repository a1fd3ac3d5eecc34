//! Association cascades
//!
//! Belongs-to records are saved before their owner so the owner can copy
//! their keys; has-one, has-many and many-to-many records are saved after it
//! so they can receive the owner's keys.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::CallbackFuture;
use crate::db::Db;
use crate::error::ModelResult;
use crate::relationships::{RelationshipDescriptor, RelationshipKind};
use crate::schema::{EntityMetadata, FieldMetadata};
use crate::scope::Scope;

/// What a cascade may do for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CascadePolicy {
    auto_update: bool,
    auto_create: bool,
    save_reference: bool,
}

fn is_enabled(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

/// Cascade policy of a field, `None` when the field is not cascaded at all.
/// Per-call options win over annotations.
fn cascade_policy(scope: &Scope, field: &FieldMetadata) -> Option<CascadePolicy> {
    if !scope.changeable(field) || field.is_ignored() || field.is_blank_in(&scope.value) {
        return None;
    }
    field.relationship()?;

    let settings = field.settings();
    let options = &scope.db.options;
    let lookup = |option: Option<bool>, key: &str| -> Option<bool> {
        option.or_else(|| settings.get(key).map(is_enabled))
    };

    let master = options
        .save_associations
        .or_else(|| (!scope.db.config().save_associations).then_some(false));
    let all = lookup(master, "SAVE_ASSOCIATIONS").unwrap_or(true);

    Some(CascadePolicy {
        auto_update: lookup(options.association_autoupdate, "ASSOCIATION_AUTOUPDATE").unwrap_or(all),
        auto_create: lookup(options.association_autocreate, "ASSOCIATION_AUTOCREATE").unwrap_or(all),
        save_reference: lookup(options.association_save_reference, "ASSOCIATION_SAVE_REFERENCE").unwrap_or(all),
    })
}

/// Save a related record on a fresh handle sharing the owner's connection
async fn save_record(db: &Db, meta: Arc<EntityMetadata>, record: &mut JsonValue, policy: CascadePolicy) -> ModelResult<()> {
    let session = db.new_session();
    if meta.primary_key_zero(record) {
        if policy.auto_create {
            session.save_value(meta, record).await?;
        }
    } else if policy.auto_update {
        session.save_value(meta, record).await?;
    }
    Ok(())
}

pub(crate) fn save_before_associations(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        let meta = scope.metadata().clone();
        for field in meta.fields() {
            let Some(policy) = cascade_policy(scope, field) else {
                continue;
            };
            let Some(relationship) = field.relationship() else {
                continue;
            };
            if relationship.kind != RelationshipKind::BelongsTo {
                continue;
            }

            let target = scope.db.metadata_of(relationship.target);
            let Some(slot) = field.get_mut(&mut scope.value) else {
                continue;
            };
            let mut record = std::mem::take(slot);
            let outcome = save_record(&scope.db, target.clone(), &mut record, policy).await;

            if outcome.is_ok() && policy.save_reference {
                copy_keys(
                    &target,
                    &record,
                    &relationship.association_foreign_field_names,
                    &meta,
                    &mut scope.value,
                    &relationship.foreign_field_names,
                );
            }
            field.set(&mut scope.value, record);

            if let Err(error) = outcome {
                scope.add_error(error);
                break;
            }
        }
    })
}

pub(crate) fn save_after_associations(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        let meta = scope.metadata().clone();
        for field in meta.fields() {
            let Some(policy) = cascade_policy(scope, field) else {
                continue;
            };
            let Some(relationship) = field.relationship() else {
                continue;
            };
            if relationship.kind == RelationshipKind::BelongsTo {
                continue;
            }

            let target = scope.db.metadata_of(relationship.target);
            let Some(slot) = field.get_mut(&mut scope.value) else {
                continue;
            };
            let mut related = std::mem::take(slot);
            let outcome = match &mut related {
                JsonValue::Array(items) => {
                    let mut outcome = Ok(());
                    for item in items.iter_mut() {
                        outcome = save_dependent(scope, &meta, relationship, &target, item, policy).await;
                        if outcome.is_err() {
                            break;
                        }
                    }
                    outcome
                }
                JsonValue::Null => Ok(()),
                item => save_dependent(scope, &meta, relationship, &target, item, policy).await,
            };
            field.set(&mut scope.value, related);

            if let Err(error) = outcome {
                scope.add_error(error);
                break;
            }
        }
    })
}

/// Save one record that points at the owner, by foreign key or junction row
async fn save_dependent(
    scope: &Scope,
    owner_meta: &EntityMetadata,
    relationship: &RelationshipDescriptor,
    target: &Arc<EntityMetadata>,
    item: &mut JsonValue,
    policy: CascadePolicy,
) -> ModelResult<()> {
    if policy.save_reference && relationship.join_table.is_none() {
        copy_keys(
            owner_meta,
            &scope.value,
            &relationship.association_foreign_field_names,
            target,
            item,
            &relationship.foreign_field_names,
        );
        if let (Some(type_field), Some(value)) = (&relationship.polymorphic_type, &relationship.polymorphic_value) {
            if let Some(field) = target.field(type_field) {
                field.set(item, JsonValue::String(value.clone()));
            }
        }
    }

    save_record(&scope.db, target.clone(), item, policy).await?;

    if let Some(join_table) = &relationship.join_table {
        if policy.save_reference && !target.primary_key_zero(item) {
            join_table
                .add(&scope.db.new_session(), owner_meta, &scope.value, target, item)
                .await?;
        }
    }
    Ok(())
}

/// Copy key values field by field from one instance onto another
fn copy_keys(
    from_meta: &EntityMetadata,
    from: &JsonValue,
    from_fields: &[String],
    to_meta: &EntityMetadata,
    to: &mut JsonValue,
    to_fields: &[String],
) {
    for (from_name, to_name) in from_fields.iter().zip(to_fields) {
        if let (Some(source), Some(target)) = (from_meta.field(from_name), to_meta.field(to_name)) {
            target.set(to, source.get(from).clone());
        }
    }
}
