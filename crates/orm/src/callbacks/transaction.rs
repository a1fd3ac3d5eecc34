use tracing::{debug, warn};

use super::CallbackFuture;
use crate::scope::Scope;

/// Open a transaction for the operation unless the handle already runs in
/// one. Failing to begin degrades to running without a transaction.
pub(crate) fn begin_transaction(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        match scope.db.begin_nested().await {
            None => {}
            Some(Ok(executor)) => {
                scope.db.executor = executor;
                scope.opened_transaction = true;
            }
            Some(Err(error)) => {
                warn!(table = %scope.table_name(), error = %error, "could not begin transaction, continuing without one");
            }
        }
    })
}

/// Commit, or roll back when any step recorded an error
pub(crate) fn commit_or_rollback_transaction(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        if !scope.opened_transaction {
            return;
        }
        scope.opened_transaction = false;
        let commit = !scope.has_error();
        if !commit {
            debug!(table = %scope.table_name(), "rolling back");
        }
        if let Err(error) = scope.db.finish_transaction(commit).await {
            scope.add_error(error);
        }
    })
}
