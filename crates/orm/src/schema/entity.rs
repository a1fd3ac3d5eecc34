//! Entity declaration
//!
//! Record types describe their shape once through an [`EntityDescriptor`]
//! builder. The schema registry turns the descriptor into cached
//! [`EntityMetadata`](super::EntityMetadata).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::ModelResult;

/// A record type mapped to a table.
///
/// Instances travel through the engine as JSON objects keyed by field name.
/// Columns read back as `NULL` are dropped before deserializing, so entity
/// types should carry `#[serde(default)]`.
///
/// ```ignore
/// impl Entity for Post {
///     fn describe() -> EntityDescriptor {
///         EntityDescriptor::new("Post")
///             .field("id", ScalarKind::Int, "primary_key")
///             .field("title", ScalarKind::Text, "size:200")
///             .field("category_id", ScalarKind::Int, "")
///             .one::<Category>("category", "")
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn describe() -> EntityDescriptor;
}

/// Scalar column kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Text,
    DateTime,
    Date,
    Bytes,
    Uuid,
    Json,
}

/// Identity of an entity type plus a way to describe it
#[derive(Clone, Copy)]
pub struct EntityRef {
    type_id: TypeId,
    rust_name: &'static str,
    describe: fn() -> EntityDescriptor,
}

impl EntityRef {
    pub fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            rust_name: std::any::type_name::<T>(),
            describe: T::describe,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn rust_name(&self) -> &'static str {
        self.rust_name
    }

    pub(crate) fn describe(&self) -> EntityDescriptor {
        (self.describe)()
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EntityRef {}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityRef").field(&self.rust_name).finish()
    }
}

/// Shape of a declared field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    Scalar(ScalarKind),
    /// A single related record
    One(EntityRef),
    /// An ordered sequence of related records
    Many(EntityRef),
    /// A record whose fields are flattened into the owner's table
    Embedded(EntityRef),
}

/// One declared field before parsing
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub tag: String,
    pub shape: FieldShape,
}

/// Points in the persistence pipeline where entity hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeSave,
    BeforeCreate,
    AfterCreate,
    AfterSave,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    AfterFind,
}

/// Type-erased entity hook operating on the JSON form of an instance
pub type EntityHook = Arc<dyn Fn(&mut JsonValue) -> ModelResult<()> + Send + Sync>;

/// Hooks declared by an entity
#[derive(Clone, Default)]
pub struct EntityHooks {
    hooks: HashMap<HookPoint, EntityHook>,
}

impl EntityHooks {
    pub fn get(&self, point: HookPoint) -> Option<&EntityHook> {
        self.hooks.get(&point)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for EntityHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.hooks.keys()).finish()
    }
}

/// Builder describing an entity's fields, annotations and hooks
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub(crate) type_name: String,
    pub(crate) table_name: Option<String>,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) hooks: EntityHooks,
}

impl EntityDescriptor {
    /// Start a descriptor for the named type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table_name: None,
            fields: Vec::new(),
            hooks: EntityHooks::default(),
        }
    }

    /// Override the default table name
    pub fn table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Declare a scalar column
    pub fn field(mut self, name: impl Into<String>, kind: ScalarKind, tag: impl Into<String>) -> Self {
        self.push(name.into(), tag.into(), FieldShape::Scalar(kind));
        self
    }

    /// Declare a field holding one related record
    pub fn one<T: Entity>(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.push(name.into(), tag.into(), FieldShape::One(EntityRef::of::<T>()));
        self
    }

    /// Declare a field holding a sequence of related records
    pub fn many<T: Entity>(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.push(name.into(), tag.into(), FieldShape::Many(EntityRef::of::<T>()));
        self
    }

    /// Declare an embedded record whose columns live in this table
    pub fn embed<T: Entity>(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.push(name.into(), tag.into(), FieldShape::Embedded(EntityRef::of::<T>()));
        self
    }

    /// Register a lifecycle hook. The hook sees a typed copy of the instance
    /// and any change it makes is written back.
    pub fn hook<T, F>(mut self, point: HookPoint, hook: F) -> Self
    where
        T: Entity,
        F: Fn(&mut T) -> ModelResult<()> + Send + Sync + 'static,
    {
        let erased: EntityHook = Arc::new(move |value: &mut JsonValue| {
            let mut typed: T = decode(value.clone())?;
            hook(&mut typed)?;
            let updated = encode(&typed)?;
            merge_into(value, updated);
            Ok(())
        });
        self.hooks.hooks.insert(point, erased);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn push(&mut self, name: String, tag: String, shape: FieldShape) {
        self.fields.push(FieldDescriptor { name, tag, shape });
    }
}

/// JSON form of an instance
pub(crate) fn encode<T: Entity>(value: &T) -> ModelResult<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

/// Rebuild an instance from its JSON form
pub(crate) fn decode<T: Entity>(mut value: JsonValue) -> ModelResult<T> {
    strip_nulls(&mut value);
    Ok(serde_json::from_value(value)?)
}

fn strip_nulls(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        JsonValue::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Overwrite keys of `target` with those of `source`, keeping keys the typed
/// form does not serialize.
fn merge_into(target: &mut JsonValue, source: JsonValue) {
    match (target, source) {
        (JsonValue::Object(target), JsonValue::Object(source)) => {
            for (key, value) in source {
                target.insert(key, value);
            }
        }
        (target, source) => *target = source,
    }
}
