//! Entity schema: declaration, naming conventions, annotations, and the
//! cached metadata the rest of the engine reads.

pub mod entity;
pub mod metadata;
pub mod naming;
pub mod registry;
pub mod tags;

pub use entity::{
    Entity, EntityDescriptor, EntityHook, EntityHooks, EntityRef, FieldDescriptor, FieldShape,
    HookPoint, ScalarKind,
};
pub use metadata::{EntityMetadata, FieldKind, FieldMetadata};
pub use naming::{pluralize, table_name_for, to_db_name};
pub use registry::SchemaRegistry;
pub use tags::TagSettings;
