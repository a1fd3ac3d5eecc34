//! Relationships between entities: resolved descriptors, the inference that
//! produces them, and junction-table handling for many-to-many links.

pub mod descriptor;
pub mod join_table;
pub(crate) mod resolver;

pub use descriptor::{RelationshipDescriptor, RelationshipKind};
pub use join_table::{JoinTableDescriptor, JoinTableKey, JoinTableSide};
