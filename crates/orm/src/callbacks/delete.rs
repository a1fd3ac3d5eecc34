use super::CallbackFuture;
use crate::backends::DatabaseValue;
use crate::error::{ModelError, ModelResult};
use crate::schema::HookPoint;
use crate::scope::Scope;
use crate::search::SqlBuilder;

pub(crate) fn before_delete(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.has_error() {
            scope.call_hook(HookPoint::BeforeDelete);
        }
    })
}

/// Delete matching rows, or stamp `deleted_at` when the entity has one and
/// the handle is scoped
pub(crate) fn delete(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        if let Err(error) = delete_rows(scope).await {
            scope.add_error(error);
        }
    })
}

async fn delete_rows(scope: &mut Scope) -> ModelResult<()> {
    if !scope.has_restriction() {
        return Err(ModelError::MissingPrimaryKey);
    }

    let dialect = scope.dialect();
    let mut builder = SqlBuilder::new(dialect);
    let soft_delete = if scope.db.search.unscoped {
        None
    } else {
        scope.metadata().field_by_column("deleted_at").map(|f| f.column().to_string())
    };

    match soft_delete {
        Some(column) => {
            builder
                .push_str("UPDATE ")
                .push_str(&scope.quoted_table_name())
                .push_str(&format!(" SET {} = ", dialect.quote(&column)));
            builder.bind(DatabaseValue::DateTime(chrono::Utc::now()));
        }
        None => {
            builder.push_str("DELETE FROM ").push_str(&scope.quoted_table_name());
        }
    }
    builder.push_where(&scope.combined_conditions());

    let (sql, args) = builder.finish();
    scope.rows_affected = scope.db.execute_raw(&sql, args).await?;
    Ok(())
}

pub(crate) fn after_delete(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterDelete);
        }
    })
}
