//! Schema registry
//!
//! Builds [`EntityMetadata`] on first use and caches it by type identity.
//! Lookups that hit the cache take the read lock only. A miss takes the write
//! lock for the whole build: the new entry is published in the `Building`
//! state before its relationships are resolved, so a related type that points
//! back at it finds the entry instead of building it a second time.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::entity::{Entity, EntityRef};
use super::metadata::EntityMetadata;
use crate::relationships::resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Building,
    Ready,
}

#[derive(Debug)]
struct CacheEntry {
    state: BuildState,
    metadata: Arc<EntityMetadata>,
}

/// Process-wide cache of entity metadata
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: RwLock<HashMap<TypeId, CacheEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata of `T`, building it on first use
    pub fn get<T: Entity>(&self) -> Arc<EntityMetadata> {
        self.get_or_build(EntityRef::of::<T>())
    }

    /// Metadata of the referenced entity, building it on first use.
    ///
    /// The returned metadata always has its relationships resolved.
    pub fn get_or_build(&self, entity: EntityRef) -> Arc<EntityMetadata> {
        {
            let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = entries.get(&entity.type_id()) {
                if entry.state == BuildState::Ready {
                    return entry.metadata.clone();
                }
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ctx = BuildContext { entries: &mut entries };
        let metadata = ctx.metadata_of(entity);
        ctx.finish();
        metadata
    }

    /// Whether the entity's metadata has been built
    pub fn contains(&self, entity: EntityRef) -> bool {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(&entity.type_id())
            .map(|entry| entry.state == BuildState::Ready)
            .unwrap_or(false)
    }

    /// Number of cached entities
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build state shared by one registry miss and every build it recursively
/// triggers. Holds the registry's write lock.
pub(crate) struct BuildContext<'a> {
    entries: &'a mut HashMap<TypeId, CacheEntry>,
}

impl BuildContext<'_> {
    /// Cached metadata of `entity`, building it if absent. The result may still
    /// be `Building` when called from inside a resolution cycle.
    pub(crate) fn metadata_of(&mut self, entity: EntityRef) -> Arc<EntityMetadata> {
        if let Some(entry) = self.entries.get(&entity.type_id()) {
            return entry.metadata.clone();
        }

        let metadata = Arc::new(EntityMetadata::from_descriptor(entity, entity.describe()));
        debug!(
            entity = %metadata.type_name(),
            table = %metadata.table_name(),
            fields = metadata.fields().len(),
            "building entity metadata"
        );
        self.entries.insert(
            entity.type_id(),
            CacheEntry {
                state: BuildState::Building,
                metadata: metadata.clone(),
            },
        );

        for field in metadata.fields() {
            resolver::resolve_field(self, &metadata, field);
        }
        metadata
    }

    /// Mark every entry built under this context as ready
    fn finish(self) {
        for entry in self.entries.values_mut() {
            entry.state = BuildState::Ready;
        }
    }
}
