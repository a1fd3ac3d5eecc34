use std::collections::BTreeMap;

use super::create::now_json;
use super::CallbackFuture;
use crate::backends::DatabaseValue;
use crate::error::{ModelError, ModelResult};
use crate::keys;
use crate::relationships::RelationshipKind;
use crate::schema::HookPoint;
use crate::scope::Scope;
use crate::search::SqlBuilder;

/// Turn the attributes handed to an update into column values, writing them
/// onto the instance. Skips the rest of the chain when nothing applies.
pub(crate) fn assign_updating_attributes(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        let Some(attributes) = scope.update_interface.take() else {
            return;
        };
        let meta = scope.metadata().clone();
        let mut attrs = BTreeMap::new();
        for (key, value) in attributes {
            let Some(field) = meta.field(&key) else {
                continue;
            };
            if !field.is_normal() || !scope.changeable(field) {
                continue;
            }
            field.set(&mut scope.value, value.clone());
            attrs.insert(field.column().to_string(), value);
        }
        if attrs.is_empty() {
            scope.skip_left();
        } else {
            scope.update_attrs = Some(attrs);
        }
    })
}

pub(crate) fn before_update(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.db.options.update_column {
            return;
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::BeforeSave);
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::BeforeUpdate);
        }
    })
}

pub(crate) fn update_time_stamp(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() || scope.db.options.update_column {
            return;
        }
        scope.set_column("updated_at", now_json());
    })
}

pub(crate) fn update(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        if let Err(error) = update_row(scope).await {
            scope.add_error(error);
        }
    })
}

async fn update_row(scope: &mut Scope) -> ModelResult<()> {
    let meta = scope.metadata().clone();
    let mut sets: Vec<(String, DatabaseValue)> = Vec::new();

    match &scope.update_attrs {
        Some(attrs) => {
            for (column, value) in attrs {
                let bound = match meta.field(column).and_then(|f| f.scalar_kind()) {
                    Some(kind) => DatabaseValue::from_field_json(kind, value),
                    None => DatabaseValue::from_json(value.clone()),
                };
                sets.push((column.clone(), bound));
            }
        }
        None => {
            for field in meta.fields() {
                if !scope.changeable(field) {
                    continue;
                }
                if field.is_normal() {
                    let blank_created = field.column() == "created_at" && field.is_blank_in(&scope.value);
                    if !field.is_primary_key() && !blank_created {
                        sets.push((field.column().to_string(), keys::field_database_value(field, &scope.value)));
                    }
                } else if let Some(relationship) = field.relationship() {
                    if relationship.kind != RelationshipKind::BelongsTo {
                        continue;
                    }
                    for name in &relationship.foreign_field_names {
                        if let Some(foreign) = meta.field(name) {
                            if !scope.changeable(foreign) && !sets.iter().any(|(c, _)| c == foreign.column()) {
                                sets.push((
                                    foreign.column().to_string(),
                                    keys::field_database_value(foreign, &scope.value),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    if sets.is_empty() {
        return Ok(());
    }
    if !scope.has_restriction() {
        return Err(ModelError::MissingPrimaryKey);
    }

    let dialect = scope.dialect();
    let mut builder = SqlBuilder::new(dialect);
    builder
        .push_str("UPDATE ")
        .push_str(&scope.quoted_table_name())
        .push_str(" SET ");
    for (index, (column, value)) in sets.into_iter().enumerate() {
        if index > 0 {
            builder.push_str(", ");
        }
        builder.push_str(&format!("{} = ", dialect.quote(&column)));
        builder.bind(value);
    }
    builder.push_where(&scope.combined_conditions());

    let (sql, args) = builder.finish();
    scope.rows_affected = scope.db.execute_raw(&sql, args).await?;
    Ok(())
}

pub(crate) fn after_update(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.db.options.update_column {
            return;
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterUpdate);
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterSave);
        }
    })
}
