//! Callback pipeline
//!
//! Every operation kind runs an ordered chain of named callbacks over a
//! [`Scope`]. Callbacks are registered with optional `before`/`after`
//! anchors; the chain is re-linearized after every change.
//!
//! ```ignore
//! fn audit(scope: &mut Scope) -> CallbackFuture<'_> {
//!     Box::pin(async move {
//!         tracing::info!(table = %scope.table_name(), "writing");
//!     })
//! }
//!
//! db.callback().create().before("tether:create").register("audit", audit);
//! ```

mod associations;
mod create;
mod delete;
mod query;
mod transaction;
mod update;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::scope::Scope;

/// Future returned by a callback, borrowing the scope it runs on
pub type CallbackFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A registered callback
pub type Callback = Arc<dyn for<'a> Fn(&'a mut Scope) -> CallbackFuture<'a> + Send + Sync>;

/// Operation kinds with their own callback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Create,
    Update,
    Delete,
    Query,
    RowQuery,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackKind::Create => "create",
            CallbackKind::Update => "update",
            CallbackKind::Delete => "delete",
            CallbackKind::Query => "query",
            CallbackKind::RowQuery => "row_query",
        };
        f.write_str(name)
    }
}

fn callback<F>(f: F) -> Callback
where
    F: for<'a> Fn(&'a mut Scope) -> CallbackFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Processor {
    name: String,
    before: Option<String>,
    after: Option<String>,
    remove: bool,
    callback: Callback,
}

/// Registered processors and their linearized chains, per kind
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    processors: HashMap<CallbackKind, Vec<Processor>>,
    chains: HashMap<CallbackKind, Vec<(String, Callback)>>,
}

impl CallbackRegistry {
    /// Registry holding the built-in chains
    pub(crate) fn with_defaults() -> Self {
        let mut registry = Self::default();
        let defaults: [(CallbackKind, Vec<(&str, Callback)>); 5] = [
            (
                CallbackKind::Create,
                vec![
                    ("tether:begin_transaction", callback(transaction::begin_transaction)),
                    ("tether:before_create", callback(create::before_create)),
                    ("tether:save_before_associations", callback(associations::save_before_associations)),
                    ("tether:update_time_stamp", callback(create::update_time_stamp)),
                    ("tether:create", callback(create::create)),
                    ("tether:save_after_associations", callback(associations::save_after_associations)),
                    ("tether:after_create", callback(create::after_create)),
                    ("tether:commit_or_rollback_transaction", callback(transaction::commit_or_rollback_transaction)),
                ],
            ),
            (
                CallbackKind::Update,
                vec![
                    ("tether:assign_updating_attributes", callback(update::assign_updating_attributes)),
                    ("tether:begin_transaction", callback(transaction::begin_transaction)),
                    ("tether:before_update", callback(update::before_update)),
                    ("tether:save_before_associations", callback(associations::save_before_associations)),
                    ("tether:update_time_stamp", callback(update::update_time_stamp)),
                    ("tether:update", callback(update::update)),
                    ("tether:save_after_associations", callback(associations::save_after_associations)),
                    ("tether:after_update", callback(update::after_update)),
                    ("tether:commit_or_rollback_transaction", callback(transaction::commit_or_rollback_transaction)),
                ],
            ),
            (
                CallbackKind::Delete,
                vec![
                    ("tether:begin_transaction", callback(transaction::begin_transaction)),
                    ("tether:before_delete", callback(delete::before_delete)),
                    ("tether:delete", callback(delete::delete)),
                    ("tether:after_delete", callback(delete::after_delete)),
                    ("tether:commit_or_rollback_transaction", callback(transaction::commit_or_rollback_transaction)),
                ],
            ),
            (
                CallbackKind::Query,
                vec![
                    ("tether:query", callback(query::query)),
                    ("tether:preload", callback(query::preload)),
                    ("tether:after_query", callback(query::after_query)),
                ],
            ),
            (CallbackKind::RowQuery, vec![("tether:row_query", callback(query::row_query))]),
        ];

        for (kind, callbacks) in defaults {
            let processors = registry.processors.entry(kind).or_default();
            for (name, callback) in callbacks {
                processors.push(Processor {
                    name: name.to_string(),
                    before: None,
                    after: None,
                    remove: false,
                    callback,
                });
            }
            registry.relink(kind);
        }
        registry
    }

    fn register(&mut self, kind: CallbackKind, processor: Processor) {
        let processors = self.processors.entry(kind).or_default();
        if processors.iter().any(|p| p.name == processor.name) {
            warn!(kind = %kind, name = %processor.name, "duplicated callback");
        }
        processors.push(processor);
        self.relink(kind);
    }

    /// Swap the callback of the last processor with this name, keeping its
    /// position, or register it when absent
    fn replace(&mut self, kind: CallbackKind, processor: Processor) {
        let processors = self.processors.entry(kind).or_default();
        match processors.iter_mut().rev().find(|p| p.name == processor.name) {
            Some(existing) => {
                existing.callback = processor.callback;
                existing.remove = false;
            }
            None => processors.push(processor),
        }
        self.relink(kind);
    }

    /// Flag processors with this name; they keep anchoring others
    fn remove(&mut self, kind: CallbackKind, name: &str) {
        let processors = self.processors.entry(kind).or_default();
        let mut found = false;
        for processor in processors.iter_mut().filter(|p| p.name == name) {
            processor.remove = true;
            found = true;
        }
        if !found {
            debug!(kind = %kind, name, "removing unknown callback");
        }
        self.relink(kind);
    }

    fn relink(&mut self, kind: CallbackKind) {
        let processors = self.processors.get(&kind).map(Vec::as_slice).unwrap_or_default();
        let chain = sort_processors(processors)
            .into_iter()
            .map(|index| &processors[index])
            .filter(|p| !p.remove)
            .map(|p| (p.name.clone(), p.callback.clone()))
            .collect();
        self.chains.insert(kind, chain);
    }

    pub(crate) fn chain(&self, kind: CallbackKind) -> Vec<Callback> {
        self.chains
            .get(&kind)
            .map(|chain| chain.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn names(&self, kind: CallbackKind) -> Vec<String> {
        self.chains
            .get(&kind)
            .map(|chain| chain.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }
}

/// Linearize processors honoring their anchors, in registration order.
///
/// An anchor names the last processor registered under that name. Returns
/// indexes into `processors`.
fn sort_processors(processors: &[Processor]) -> Vec<usize> {
    struct Sorter<'p> {
        processors: &'p [Processor],
        before: Vec<Option<String>>,
        visiting: Vec<bool>,
        sorted: Vec<usize>,
    }

    impl Sorter<'_> {
        fn last_index(&self, name: &str) -> Option<usize> {
            self.processors.iter().rposition(|p| p.name == name)
        }

        fn sorted_position(&self, name: &str) -> Option<usize> {
            let index = self.last_index(name)?;
            self.sorted.iter().position(|&i| i == index)
        }

        fn place(&mut self, index: usize) {
            if self.visiting[index] || self.sorted.contains(&index) {
                return;
            }
            self.visiting[index] = true;

            if let Some(anchor) = self.before[index].clone() {
                if let Some(position) = self.sorted_position(&anchor) {
                    self.sorted.insert(position, index);
                } else if let Some(anchor_index) = self.last_index(&anchor) {
                    self.sorted.push(index);
                    self.place(anchor_index);
                }
            }

            if let Some(anchor) = self.processors[index].after.clone() {
                if let Some(position) = self.sorted_position(&anchor) {
                    if !self.sorted.contains(&index) {
                        self.sorted.insert(position + 1, index);
                    }
                } else if let Some(anchor_index) = self.last_index(&anchor) {
                    if self.before[anchor_index].is_none() {
                        self.before[anchor_index] = Some(self.processors[index].name.clone());
                    }
                    self.place(anchor_index);
                }
            }

            if !self.sorted.contains(&index) {
                self.sorted.push(index);
            }
        }
    }

    let mut sorter = Sorter {
        processors,
        before: processors.iter().map(|p| p.before.clone()).collect(),
        visiting: vec![false; processors.len()],
        sorted: Vec::with_capacity(processors.len()),
    };
    for index in 0..processors.len() {
        sorter.place(index);
    }
    sorter.sorted
}

/// Run the chain of `kind` over a scope, stopping early when a callback
/// asks to skip the rest
pub(crate) async fn run(kind: CallbackKind, scope: &mut Scope) {
    let chain = {
        let registry = scope
            .db
            .shared
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.chain(kind)
    };
    for callback in chain {
        callback(scope).await;
        if scope.skip_left {
            break;
        }
    }
}

/// Entry point for changing callback chains, see [`Db::callback`](crate::Db::callback)
pub struct Callbacks<'r> {
    registry: &'r RwLock<CallbackRegistry>,
}

impl<'r> Callbacks<'r> {
    pub(crate) fn new(registry: &'r RwLock<CallbackRegistry>) -> Self {
        Self { registry }
    }

    fn processor(&self, kind: CallbackKind) -> CallbackProcessor<'r> {
        CallbackProcessor {
            registry: self.registry,
            kind,
            before: None,
            after: None,
        }
    }

    pub fn create(&self) -> CallbackProcessor<'r> {
        self.processor(CallbackKind::Create)
    }

    pub fn update(&self) -> CallbackProcessor<'r> {
        self.processor(CallbackKind::Update)
    }

    pub fn delete(&self) -> CallbackProcessor<'r> {
        self.processor(CallbackKind::Delete)
    }

    pub fn query(&self) -> CallbackProcessor<'r> {
        self.processor(CallbackKind::Query)
    }

    pub fn row_query(&self) -> CallbackProcessor<'r> {
        self.processor(CallbackKind::RowQuery)
    }
}

/// Registration directive for one chain
pub struct CallbackProcessor<'r> {
    registry: &'r RwLock<CallbackRegistry>,
    kind: CallbackKind,
    before: Option<String>,
    after: Option<String>,
}

impl CallbackProcessor<'_> {
    /// Place the callback before the named one
    pub fn before(mut self, name: &str) -> Self {
        self.before = Some(name.to_string());
        self
    }

    /// Place the callback after the named one
    pub fn after(mut self, name: &str) -> Self {
        self.after = Some(name.to_string());
        self
    }

    fn build<F>(&self, name: &str, f: F) -> Processor
    where
        F: for<'a> Fn(&'a mut Scope) -> CallbackFuture<'a> + Send + Sync + 'static,
    {
        Processor {
            name: name.to_string(),
            before: self.before.clone(),
            after: self.after.clone(),
            remove: false,
            callback: callback(f),
        }
    }

    fn with_registry(&self, f: impl FnOnce(&mut CallbackRegistry)) {
        let mut registry = self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut registry);
    }

    pub fn register<F>(self, name: &str, callback: F)
    where
        F: for<'a> Fn(&'a mut Scope) -> CallbackFuture<'a> + Send + Sync + 'static,
    {
        let processor = self.build(name, callback);
        self.with_registry(|registry| registry.register(self.kind, processor));
    }

    pub fn replace<F>(self, name: &str, callback: F)
    where
        F: for<'a> Fn(&'a mut Scope) -> CallbackFuture<'a> + Send + Sync + 'static,
    {
        let processor = self.build(name, callback);
        self.with_registry(|registry| registry.replace(self.kind, processor));
    }

    pub fn remove(self, name: &str) {
        self.with_registry(|registry| registry.remove(self.kind, name));
    }

    /// Names of the chain in execution order
    pub fn names(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .names(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_scope: &mut Scope) -> CallbackFuture<'_> {
        Box::pin(async {})
    }

    fn processor(name: &str, before: Option<&str>, after: Option<&str>) -> Processor {
        Processor {
            name: name.to_string(),
            before: before.map(str::to_string),
            after: after.map(str::to_string),
            remove: false,
            callback: Arc::new(noop),
        }
    }

    fn names(registry: &CallbackRegistry) -> Vec<String> {
        registry.names(CallbackKind::Create)
    }

    fn plain(names: &[&str]) -> CallbackRegistry {
        let mut registry = CallbackRegistry::default();
        for name in names {
            registry.register(CallbackKind::Create, processor(name, None, None));
        }
        registry
    }

    #[test]
    fn test_default_create_chain() {
        let registry = CallbackRegistry::with_defaults();
        assert_eq!(
            names(&registry),
            vec![
                "tether:begin_transaction",
                "tether:before_create",
                "tether:save_before_associations",
                "tether:update_time_stamp",
                "tether:create",
                "tether:save_after_associations",
                "tether:after_create",
                "tether:commit_or_rollback_transaction",
            ]
        );
        assert_eq!(registry.names(CallbackKind::RowQuery), vec!["tether:row_query"]);
    }

    #[test]
    fn test_before_and_after_anchors() {
        let mut registry = plain(&["a", "b", "c"]);
        registry.register(CallbackKind::Create, processor("x", Some("b"), None));
        registry.register(CallbackKind::Create, processor("y", None, Some("a")));
        assert_eq!(names(&registry), vec!["a", "y", "x", "b", "c"]);
    }

    #[test]
    fn test_anchor_registered_later() {
        let mut registry = CallbackRegistry::default();
        registry.register(CallbackKind::Create, processor("late", None, Some("first")));
        registry.register(CallbackKind::Create, processor("first", None, None));
        assert_eq!(names(&registry), vec!["first", "late"]);

        let mut registry = CallbackRegistry::default();
        registry.register(CallbackKind::Create, processor("early", Some("second"), None));
        registry.register(CallbackKind::Create, processor("second", None, None));
        assert_eq!(names(&registry), vec!["early", "second"]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut registry = plain(&["a", "b", "c"]);
        registry.replace(CallbackKind::Create, processor("b", None, None));
        assert_eq!(names(&registry), vec!["a", "b", "c"]);
        registry.replace(CallbackKind::Create, processor("d", None, None));
        assert_eq!(names(&registry), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_removed_callback_still_anchors() {
        let mut registry = plain(&["a", "b", "c"]);
        registry.remove(CallbackKind::Create, "b");
        assert_eq!(names(&registry), vec!["a", "c"]);
        registry.register(CallbackKind::Create, processor("x", Some("b"), None));
        assert_eq!(names(&registry), vec!["a", "x", "c"]);
    }

    #[test]
    fn test_duplicate_names_are_kept() {
        let registry = plain(&["a", "a"]);
        assert_eq!(names(&registry), vec!["a", "a"]);
        assert_eq!(registry.chain(CallbackKind::Create).len(), 2);
    }
}
