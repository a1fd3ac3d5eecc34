use serde_json::Value as JsonValue;

use super::CallbackFuture;
use crate::error::{ModelError, ModelResult};
use crate::preload;
use crate::schema::HookPoint;
use crate::scope::{scan_row, Scope};

/// Run the select and scan the rows into the scope's value
pub(crate) fn query(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        if let Err(error) = select_rows(scope).await {
            scope.add_error(error);
        }
    })
}

async fn select_rows(scope: &mut Scope) -> ModelResult<()> {
    let meta = scope.metadata().clone();
    let (sql, args) = scope.select_sql();

    if scope.many {
        let rows = scope.db.fetch_raw(&sql, args).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut instance = meta.blank_instance();
            scan_row(&meta, row.as_ref(), &mut instance)?;
            items.push(instance);
        }
        scope.rows_affected = items.len() as u64;
        scope.value = JsonValue::Array(items);
        return Ok(());
    }

    match scope.db.fetch_optional_raw(&sql, args).await? {
        Some(row) => {
            if !scope.value.is_object() {
                scope.value = meta.blank_instance();
            }
            scan_row(&meta, row.as_ref(), &mut scope.value)?;
            scope.rows_affected = 1;
            Ok(())
        }
        None => Err(ModelError::NotFound(scope.table_name())),
    }
}

pub(crate) fn preload(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() || scope.db.search.preloads.is_empty() {
            return;
        }
        if let Err(error) = preload::preload(scope).await {
            scope.add_error(error);
        }
    })
}

pub(crate) fn after_query(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.has_error() {
            scope.call_hook(HookPoint::AfterFind);
        }
    })
}

/// Run the select and keep the raw rows
pub(crate) fn row_query(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if scope.has_error() {
            return;
        }
        let (sql, args) = scope.select_sql();
        match scope.db.fetch_raw(&sql, args).await {
            Ok(rows) => {
                scope.rows_affected = rows.len() as u64;
                scope.rows = rows;
            }
            Err(error) => scope.add_error(error),
        }
    })
}
