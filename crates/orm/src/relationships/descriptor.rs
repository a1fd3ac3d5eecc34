//! Resolved relationship descriptions

use std::fmt;

use super::join_table::JoinTableDescriptor;
use crate::schema::EntityRef;

/// The kind of a resolved relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// The related table holds a key pointing back at a single record
    HasOne,
    /// The related table holds a key pointing back at many records
    HasMany,
    /// This table holds the key pointing at the related record
    BelongsTo,
    /// Links are stored in a junction table
    ManyToMany,
}

impl RelationshipKind {
    /// Returns true if this relationship holds a collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::HasMany | Self::ManyToMany)
    }

    /// Returns true if the key lives on the related table
    pub fn key_on_related(self) -> bool {
        matches!(self, Self::HasOne | Self::HasMany)
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationshipKind::HasOne => "has_one",
            RelationshipKind::HasMany => "has_many",
            RelationshipKind::BelongsTo => "belongs_to",
            RelationshipKind::ManyToMany => "many_to_many",
        };
        f.write_str(name)
    }
}

/// One resolved association between two entities.
///
/// The two key lists are positionally paired and always the same length.
/// Which table each list lives on depends on the kind:
///
/// | kind | `foreign_*` | `association_*` |
/// |------|-------------|-----------------|
/// | has one / has many | key fields on the related entity | referenced fields on the owner |
/// | belongs to | key fields on the owner | referenced fields on the related entity |
/// | many to many | owner key fields, junction columns | related key fields, junction columns |
///
/// For many-to-many the `*_db_names` lists name junction-table columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    pub kind: RelationshipKind,
    /// Entity type on the other side
    pub target: EntityRef,
    pub foreign_field_names: Vec<String>,
    pub foreign_db_names: Vec<String>,
    pub association_foreign_field_names: Vec<String>,
    pub association_foreign_db_names: Vec<String>,
    /// Discriminator field on the related entity
    pub polymorphic_type: Option<String>,
    pub polymorphic_db_name: Option<String>,
    pub polymorphic_value: Option<String>,
    pub join_table: Option<JoinTableDescriptor>,
}

impl RelationshipDescriptor {
    pub fn new(kind: RelationshipKind, target: EntityRef) -> Self {
        Self {
            kind,
            target,
            foreign_field_names: Vec::new(),
            foreign_db_names: Vec::new(),
            association_foreign_field_names: Vec::new(),
            association_foreign_db_names: Vec::new(),
            polymorphic_type: None,
            polymorphic_db_name: None,
            polymorphic_value: None,
            join_table: None,
        }
    }

    /// Whether the relationship is shared through a discriminator column
    pub fn is_polymorphic(&self) -> bool {
        self.polymorphic_type.is_some()
    }

    /// Whether any key pairing was resolved
    pub fn has_keys(&self) -> bool {
        !self.foreign_field_names.is_empty()
    }

    /// Discriminator column and value, when polymorphic
    pub fn polymorphic_condition(&self) -> Option<(&str, &str)> {
        match (&self.polymorphic_db_name, &self.polymorphic_value) {
            (Some(column), Some(value)) => Some((column.as_str(), value.as_str())),
            _ => None,
        }
    }

    pub(crate) fn push_pair(
        &mut self,
        foreign_field: &str,
        foreign_db: &str,
        association_field: &str,
        association_db: &str,
    ) {
        self.foreign_field_names.push(foreign_field.to_string());
        self.foreign_db_names.push(foreign_db.to_string());
        self.association_foreign_field_names.push(association_field.to_string());
        self.association_foreign_db_names.push(association_db.to_string());
    }
}
