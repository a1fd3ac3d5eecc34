use serde_json::Value as JsonValue;

use super::CallbackFuture;
use crate::error::ModelResult;
use crate::keys;
use crate::relationships::RelationshipKind;
use crate::schema::HookPoint;
use crate::scope::Scope;
use crate::search::SqlBuilder;

pub(crate) fn before_create(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.has_error() {
            scope.call_hook(HookPoint::BeforeSave);
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::BeforeCreate);
        }
    })
}

/// Fill blank `created_at` and `updated_at` fields
pub(crate) fn update_time_stamp(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        let now = now_json();
        let meta = scope.metadata().clone();
        for column in ["created_at", "updated_at"] {
            if let Some(field) = meta.field_by_column(column) {
                if field.is_blank_in(&scope.value) {
                    field.set(&mut scope.value, now.clone());
                }
            }
        }
    })
}

pub(crate) fn now_json() -> JsonValue {
    JsonValue::String(chrono::Utc::now().to_rfc3339())
}

pub(crate) fn create(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        if let Err(error) = insert(scope).await {
            scope.add_error(error);
        }
    })
}

async fn insert(scope: &mut Scope) -> ModelResult<()> {
    let meta = scope.metadata().clone();
    let dialect = scope.dialect();

    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut reload = Vec::new();

    for field in meta.fields() {
        if !scope.changeable(field) {
            continue;
        }
        if field.is_normal() {
            if field.is_blank_in(&scope.value) {
                if field.has_default_value() {
                    reload.push(field.name().to_string());
                    continue;
                }
                if field.is_primary_key() {
                    continue;
                }
            }
            columns.push(field.column().to_string());
            values.push(keys::field_database_value(field, &scope.value));
        } else if let Some(relationship) = field.relationship() {
            if relationship.kind != RelationshipKind::BelongsTo {
                continue;
            }
            for name in &relationship.foreign_field_names {
                if let Some(foreign) = meta.field(name) {
                    if !scope.changeable(foreign) && !columns.iter().any(|c| c == foreign.column()) {
                        columns.push(foreign.column().to_string());
                        values.push(keys::field_database_value(foreign, &scope.value));
                    }
                }
            }
        }
    }

    let mut builder = SqlBuilder::new(dialect);
    builder.push_str("INSERT INTO ").push_str(&scope.quoted_table_name());
    if columns.is_empty() {
        builder.push_str(" DEFAULT VALUES");
    } else {
        let quoted: Vec<String> = columns.iter().map(|c| dialect.quote(c)).collect();
        builder.push_str(&format!(" ({}) VALUES (", quoted.join(",")));
        for (index, value) in values.into_iter().enumerate() {
            if index > 0 {
                builder.push_str(",");
            }
            builder.bind(value);
        }
        builder.push_str(")");
    }

    match meta.primary_field() {
        Some(primary) => {
            builder.push_str(" RETURNING ").push_str(&dialect.quote(primary.column()));
            let (sql, args) = builder.finish();
            if let Some(row) = scope.db.fetch_optional_raw(&sql, args).await? {
                scope.rows_affected = 1;
                if primary.is_blank_in(&scope.value) {
                    if let Some(kind) = primary.scalar_kind() {
                        let generated = row.get_by_index(0)?.into_field_json(kind);
                        primary.set(&mut scope.value, generated);
                    }
                }
            }
        }
        None => {
            let (sql, args) = builder.finish();
            scope.rows_affected = scope.db.execute_raw(&sql, args).await?;
        }
    }

    if !reload.is_empty() && !meta.primary_key_zero(&scope.value) {
        let fresh = scope
            .db
            .new_session()
            .table(&scope.table_name())
            .select(reload.iter().cloned())
            .first_value(meta.clone(), scope.value.clone())
            .await?;
        for name in &reload {
            if let Some(field) = meta.field(name) {
                field.set(&mut scope.value, field.get(&fresh).clone());
            }
        }
    }
    Ok(())
}

pub(crate) fn after_create(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterCreate);
        }
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterSave);
        }
    })
}
