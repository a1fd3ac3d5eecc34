//! Relationship inference
//!
//! Decides the kind and key pairing of every field whose value is a related
//! record or a sequence of them. Explicit annotations win; otherwise keys are
//! derived from naming conventions. A field whose keys cannot be matched stays
//! a plain field.

use tracing::debug;

use super::descriptor::{RelationshipDescriptor, RelationshipKind};
use super::join_table::JoinTableDescriptor;
use crate::error::RelationshipError;
use crate::schema::naming::to_db_name;
use crate::schema::registry::BuildContext;
use crate::schema::{EntityMetadata, FieldMetadata};

/// Resolve one field of `source`, storing the result on the field or
/// recording a failure against `source`.
pub(crate) fn resolve_field(ctx: &mut BuildContext<'_>, source: &EntityMetadata, field: &FieldMetadata) {
    let Some(target) = field.target() else {
        return;
    };
    if field.is_ignored() {
        return;
    }

    let related = ctx.metadata_of(target);
    let settings = field.settings();
    let foreign_keys = settings.list("FOREIGNKEY");
    let association_keys = settings.list("ASSOCIATIONFOREIGNKEY");

    let outcome = if field.is_many() {
        match settings.value("MANY2MANY") {
            Some(join_table) => resolve_many_to_many(source, field, &related, join_table, &foreign_keys, &association_keys),
            None => resolve_has(source, field, &related, RelationshipKind::HasMany, &foreign_keys, &association_keys),
        }
    } else {
        match resolve_has(source, field, &related, RelationshipKind::HasOne, &foreign_keys, &association_keys) {
            Ok(None) => resolve_belongs_to(source, field, &related, &foreign_keys, &association_keys),
            other => other,
        }
    };

    match outcome {
        Ok(Some(descriptor)) => {
            debug!(
                entity = %source.type_name(),
                field = %field.name(),
                kind = %descriptor.kind,
                foreign = ?descriptor.foreign_db_names,
                association = ?descriptor.association_foreign_db_names,
                "resolved relationship"
            );
            field.set_relationship(descriptor);
        }
        Ok(None) => {
            debug!(
                entity = %source.type_name(),
                field = %field.name(),
                "no usable keys, field left non-relational"
            );
        }
        Err(error) => source.record_resolution_error(error.into()),
    }
}

/// Candidate (foreign key, association key) name pairs.
///
/// `prefix` is the convention prefix of foreign key names, `owner` the entity
/// whose keys the foreign key references.
fn key_pairs(
    source: &EntityMetadata,
    field: &FieldMetadata,
    owner: &EntityMetadata,
    prefix: &str,
    tag_foreign: &[String],
    tag_association: &[String],
) -> Result<Vec<(String, String)>, RelationshipError> {
    if tag_foreign.is_empty() {
        if tag_association.is_empty() {
            return Ok(owner
                .primary_fields()
                .map(|primary| (format!("{}{}", prefix, primary.name()), primary.name().to_string()))
                .collect());
        }
        return Ok(tag_association
            .iter()
            .filter_map(|key| owner.find_key_field(key))
            .map(|referenced| (format!("{}{}", prefix, referenced.name()), referenced.name().to_string()))
            .collect());
    }

    if tag_association.is_empty() {
        let mut pairs: Vec<(String, String)> = tag_foreign
            .iter()
            .filter_map(|foreign| {
                let normalized = to_db_name(foreign);
                let stripped = normalized.strip_prefix(prefix)?;
                owner
                    .find_key_field(stripped)
                    .map(|_| (foreign.clone(), stripped.to_string()))
            })
            .collect();
        if pairs.is_empty() && tag_foreign.len() == 1 {
            pairs.push((tag_foreign[0].clone(), owner.primary_key_column().to_string()));
        }
        return Ok(pairs);
    }

    if tag_foreign.len() != tag_association.len() {
        return Err(RelationshipError::KeyMismatch {
            entity: source.type_name().to_string(),
            field: field.name().to_string(),
            foreign: tag_foreign.len(),
            association: tag_association.len(),
        });
    }
    Ok(tag_foreign.iter().cloned().zip(tag_association.iter().cloned()).collect())
}

/// Keys stored on the related table, pointing back at `source`
fn resolve_has(
    source: &EntityMetadata,
    field: &FieldMetadata,
    related: &EntityMetadata,
    kind: RelationshipKind,
    tag_foreign: &[String],
    tag_association: &[String],
) -> Result<Option<RelationshipDescriptor>, RelationshipError> {
    let mut descriptor = RelationshipDescriptor::new(kind, related.entity());
    let mut association_type = source.type_name().to_string();
    let mut discriminator = None;

    if let Some(role) = field.settings().value("POLYMORPHIC") {
        if let Some(type_field) = related.find_key_field(&format!("{}_type", to_db_name(role))) {
            association_type = role.to_string();
            descriptor.polymorphic_type = Some(type_field.name().to_string());
            descriptor.polymorphic_db_name = Some(type_field.column().to_string());
            descriptor.polymorphic_value = Some(
                field
                    .settings()
                    .value("POLYMORPHIC_VALUE")
                    .map(str::to_string)
                    .unwrap_or_else(|| source.table_name().to_string()),
            );
            discriminator = Some(type_field);
        }
    }

    let prefix = format!("{}_", to_db_name(&association_type));
    let pairs = key_pairs(source, field, source, &prefix, tag_foreign, tag_association)?;

    for (foreign, association) in pairs {
        if let (Some(foreign_field), Some(association_field)) =
            (related.find_key_field(&foreign), source.find_key_field(&association))
        {
            foreign_field.mark_foreign_key();
            descriptor.push_pair(
                foreign_field.name(),
                foreign_field.column(),
                association_field.name(),
                association_field.column(),
            );
        }
    }

    if !descriptor.has_keys() {
        return Ok(None);
    }
    if let Some(type_field) = discriminator {
        type_field.mark_foreign_key();
    }
    Ok(Some(descriptor))
}

/// Keys stored on `source`, pointing at the related record
fn resolve_belongs_to(
    source: &EntityMetadata,
    field: &FieldMetadata,
    related: &EntityMetadata,
    tag_foreign: &[String],
    tag_association: &[String],
) -> Result<Option<RelationshipDescriptor>, RelationshipError> {
    let mut descriptor = RelationshipDescriptor::new(RelationshipKind::BelongsTo, related.entity());
    let prefix = format!("{}_", to_db_name(field.name()));
    let pairs = key_pairs(source, field, related, &prefix, tag_foreign, tag_association)?;

    for (foreign, association) in pairs {
        if let (Some(foreign_field), Some(association_field)) =
            (source.find_key_field(&foreign), related.find_key_field(&association))
        {
            foreign_field.mark_foreign_key();
            descriptor.push_pair(
                foreign_field.name(),
                foreign_field.column(),
                association_field.name(),
                association_field.column(),
            );
        }
    }

    Ok(descriptor.has_keys().then_some(descriptor))
}

/// Links kept in a named junction table
fn resolve_many_to_many(
    source: &EntityMetadata,
    field: &FieldMetadata,
    related: &EntityMetadata,
    join_table: &str,
    tag_foreign: &[String],
    tag_association: &[String],
) -> Result<Option<RelationshipDescriptor>, RelationshipError> {
    let settings = field.settings();
    let mut descriptor = RelationshipDescriptor::new(RelationshipKind::ManyToMany, related.entity());

    let (source_key_columns, source_columns) = junction_keys(
        source,
        tag_foreign,
        &settings.list("JOINTABLE_FOREIGNKEY"),
        &mut descriptor.foreign_field_names,
    );
    let (related_key_columns, related_columns) = junction_keys(
        related,
        tag_association,
        &settings.list("ASSOCIATION_JOINTABLE_FOREIGNKEY"),
        &mut descriptor.association_foreign_field_names,
    );

    if source_columns.is_empty() || related_columns.is_empty() {
        return Ok(None);
    }
    if let Some(column) = source_columns.iter().find(|c| related_columns.contains(c)) {
        return Err(RelationshipError::InvalidConfiguration(format!(
            "join table {} column {} is used by both sides of {}.{}, set jointable_foreignkey and association_jointable_foreignkey",
            join_table,
            column,
            source.type_name(),
            field.name()
        )));
    }

    descriptor.join_table = Some(JoinTableDescriptor::setup(
        join_table,
        source.entity(),
        &source_columns,
        &source_key_columns,
        related.entity(),
        &related_columns,
        &related_key_columns,
    ));
    descriptor.foreign_db_names = source_columns;
    descriptor.association_foreign_db_names = related_columns;
    Ok(Some(descriptor))
}

/// Key columns of `owner` and the junction columns copying them.
/// Matched field names are appended to `field_names`.
fn junction_keys(
    owner: &EntityMetadata,
    tag_keys: &[String],
    tag_columns: &[String],
    field_names: &mut Vec<String>,
) -> (Vec<String>, Vec<String>) {
    let keys: Vec<String> = if tag_keys.is_empty() {
        owner.primary_fields().map(|f| f.column().to_string()).collect()
    } else {
        tag_keys.to_vec()
    };

    let mut key_columns = Vec::new();
    let mut columns = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        if let Some(key_field) = owner.find_key_field(key) {
            field_names.push(key_field.name().to_string());
            key_columns.push(key_field.column().to_string());
            columns.push(
                tag_columns
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("{}_{}", to_db_name(owner.type_name()), key_field.column())),
            );
        }
    }
    (key_columns, columns)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::relationships::RelationshipKind;
    use crate::schema::{Entity, EntityDescriptor, ScalarKind, SchemaRegistry};

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Owner {
        id: i64,
        code: String,
        pet: Option<Pet>,
        pets: Vec<Pet>,
        bad: Vec<Pet>,
        stickers: Vec<Sticker>,
        friends: Vec<Owner>,
        rivals: Vec<Owner>,
    }

    impl Entity for Owner {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Owner")
                .field("id", ScalarKind::Int, "primary_key")
                .field("code", ScalarKind::Text, "")
                .one::<Pet>("pet", "foreignkey:OwnerRef;associationforeignkey:Code")
                .many::<Pet>("pets", "foreignkey:OwnerCode")
                .many::<Pet>("bad", "foreignkey:OwnerRef,OwnerCode;associationforeignkey:Code")
                .many::<Sticker>("stickers", "polymorphic:Holder;polymorphic_value:owner")
                .many::<Owner>(
                    "friends",
                    "many2many:owner_friends;jointable_foreignkey:owner_id;association_jointable_foreignkey:friend_id",
                )
                .many::<Owner>("rivals", "many2many:owner_rivals")
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Pet {
        id: i64,
        owner_ref: String,
        owner_code: String,
    }

    impl Entity for Pet {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Pet")
                .field("id", ScalarKind::Int, "primary_key")
                .field("owner_ref", ScalarKind::Text, "")
                .field("owner_code", ScalarKind::Text, "")
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Sticker {
        id: i64,
        holder_id: i64,
        holder_type: String,
    }

    impl Entity for Sticker {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Sticker")
                .field("id", ScalarKind::Int, "primary_key")
                .field("holder_id", ScalarKind::Int, "")
                .field("holder_type", ScalarKind::Text, "")
        }
    }

    #[test]
    fn test_explicit_keys_pair_by_position() {
        let meta = SchemaRegistry::new().get::<Owner>();
        let pet = meta.field("pet").unwrap().relationship().unwrap();
        assert_eq!(pet.kind, RelationshipKind::HasOne);
        assert_eq!(pet.foreign_db_names, vec!["owner_ref"]);
        assert_eq!(pet.association_foreign_db_names, vec!["code"]);
    }

    #[test]
    fn test_association_key_derived_from_foreign_key() {
        let registry = SchemaRegistry::new();
        let meta = registry.get::<Owner>();
        let pets = meta.field("pets").unwrap().relationship().unwrap();
        assert_eq!(pets.kind, RelationshipKind::HasMany);
        assert_eq!(pets.foreign_db_names, vec!["owner_code"]);
        assert_eq!(pets.association_foreign_db_names, vec!["code"]);
        assert!(registry.get::<Pet>().field("owner_code").unwrap().is_foreign_key());
    }

    #[test]
    fn test_unequal_key_lists_are_recorded() {
        let meta = SchemaRegistry::new().get::<Owner>();
        assert!(meta.field("bad").unwrap().relationship().is_none());
        let messages: Vec<String> = meta.resolution_errors().iter().map(|e| e.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains(
            "invalid foreign keys on Owner.bad, should have same length (2 foreign keys, 1 association foreign keys)"
        )));
    }

    #[test]
    fn test_polymorphic_value_override() {
        let registry = SchemaRegistry::new();
        let meta = registry.get::<Owner>();
        let stickers = meta.field("stickers").unwrap().relationship().unwrap();
        assert_eq!(stickers.kind, RelationshipKind::HasMany);
        assert_eq!(stickers.foreign_db_names, vec!["holder_id"]);
        assert_eq!(stickers.polymorphic_condition(), Some(("holder_type", "owner")));
        assert!(registry.get::<Sticker>().field("holder_type").unwrap().is_foreign_key());
    }

    #[test]
    fn test_join_table_columns_from_annotations() {
        let meta = SchemaRegistry::new().get::<Owner>();
        let friends = meta.field("friends").unwrap().relationship().unwrap();
        assert_eq!(friends.kind, RelationshipKind::ManyToMany);
        assert_eq!(friends.foreign_db_names, vec!["owner_id"]);
        assert_eq!(friends.association_foreign_db_names, vec!["friend_id"]);
        let join_table = friends.join_table.as_ref().unwrap();
        assert_eq!(join_table.table_name, "owner_friends");
        assert_eq!(join_table.source_columns(), vec!["owner_id"]);
        assert_eq!(join_table.destination.keys[0].key_column, "id");
    }

    #[test]
    fn test_shared_join_table_column_is_rejected() {
        let meta = SchemaRegistry::new().get::<Owner>();
        assert!(meta.field("rivals").unwrap().relationship().is_none());
        let messages: Vec<String> = meta.resolution_errors().iter().map(|e| e.to_string()).collect();
        assert!(messages
            .iter()
            .any(|m| m.contains("join table owner_rivals column owner_id is used by both sides of Owner.rivals")));
    }
}
