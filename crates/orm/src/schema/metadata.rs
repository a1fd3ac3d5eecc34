//! Entity and field metadata
//!
//! [`EntityMetadata`] is the parsed, cached description of one entity type.
//! Its fields are fixed at build time; the only parts filled in afterwards
//! are the relationship slot and foreign-key flag of each field, both written
//! once while the registry still holds its build lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use super::entity::{EntityDescriptor, EntityHooks, EntityRef, FieldShape, ScalarKind};
use super::naming::{table_name_for, to_db_name};
use super::tags::TagSettings;
use crate::error::ModelError;
use crate::keys::is_blank;
use crate::relationships::RelationshipDescriptor;

static NULL: JsonValue = JsonValue::Null;

/// What a mapped field holds
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Scalar(ScalarKind),
    One(EntityRef),
    Many(EntityRef),
}

/// One mapped field of an entity
#[derive(Debug)]
pub struct FieldMetadata {
    name: String,
    names: Vec<String>,
    column: String,
    kind: FieldKind,
    settings: TagSettings,
    is_primary_key: bool,
    is_ignored: bool,
    has_default_value: bool,
    is_foreign_key: AtomicBool,
    relationship: OnceLock<RelationshipDescriptor>,
}

impl FieldMetadata {
    /// Logical field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name chain from the entity root, longer than one for embedded fields
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn settings(&self) -> &TagSettings {
        &self.settings
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self.kind {
            FieldKind::Scalar(kind) => Some(kind),
            _ => None,
        }
    }

    /// Entity type referenced by a relation-shaped field
    pub fn target(&self) -> Option<EntityRef> {
        match &self.kind {
            FieldKind::One(target) | FieldKind::Many(target) => Some(*target),
            FieldKind::Scalar(_) => None,
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self.kind, FieldKind::Many(_))
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    pub fn is_ignored(&self) -> bool {
        self.is_ignored
    }

    /// A plain column persisted with the row
    pub fn is_normal(&self) -> bool {
        !self.is_ignored && matches!(self.kind, FieldKind::Scalar(_))
    }

    pub fn has_default_value(&self) -> bool {
        self.has_default_value
    }

    /// Integer primary keys are generated by the database unless
    /// `auto_increment:false` says otherwise.
    pub fn is_auto_increment(&self) -> bool {
        match self.settings.get("AUTO_INCREMENT") {
            Some(value) => !value.eq_ignore_ascii_case("false"),
            None => self.is_primary_key && self.kind == FieldKind::Scalar(ScalarKind::Int),
        }
    }

    pub fn is_foreign_key(&self) -> bool {
        self.is_foreign_key.load(Ordering::Acquire)
    }

    pub(crate) fn mark_foreign_key(&self) {
        self.is_foreign_key.store(true, Ordering::Release);
    }

    pub fn relationship(&self) -> Option<&RelationshipDescriptor> {
        self.relationship.get()
    }

    pub(crate) fn set_relationship(&self, relationship: RelationshipDescriptor) -> bool {
        self.relationship.set(relationship).is_ok()
    }

    /// Read this field out of an instance; missing values read as null
    pub fn get<'v>(&self, instance: &'v JsonValue) -> &'v JsonValue {
        let mut current = instance;
        for name in &self.names {
            match current.get(name) {
                Some(next) => current = next,
                None => return &NULL,
            }
        }
        current
    }

    /// Mutable access, creating intermediate embedded objects as needed
    pub fn get_mut<'v>(&self, instance: &'v mut JsonValue) -> Option<&'v mut JsonValue> {
        let mut current = instance;
        for name in &self.names {
            if current.is_null() {
                *current = JsonValue::Object(Map::new());
            }
            let object = current.as_object_mut()?;
            current = object.entry(name.clone()).or_insert(JsonValue::Null);
        }
        Some(current)
    }

    /// Write a value into an instance
    pub fn set(&self, instance: &mut JsonValue, value: JsonValue) {
        if let Some(slot) = self.get_mut(instance) {
            *slot = value;
        }
    }

    pub fn is_blank_in(&self, instance: &JsonValue) -> bool {
        is_blank(self.get(instance))
    }
}

/// Cached description of one entity type
#[derive(Debug)]
pub struct EntityMetadata {
    entity: EntityRef,
    type_name: String,
    table_name: String,
    fields: Vec<FieldMetadata>,
    by_name: HashMap<String, usize>,
    by_column: HashMap<String, usize>,
    primary: Vec<usize>,
    hooks: EntityHooks,
    warnings: Vec<String>,
    resolution_errors: Mutex<Vec<ModelError>>,
}

impl EntityMetadata {
    /// Parse a descriptor into metadata with relationships left unresolved
    pub(crate) fn from_descriptor(entity: EntityRef, descriptor: EntityDescriptor) -> Self {
        let EntityDescriptor { type_name, table_name, fields: declared, hooks } = descriptor;

        let mut warnings = Vec::new();
        let mut fields = Vec::new();
        collect_fields(&type_name, &declared, &[], "", &mut fields, &mut warnings);

        if !fields.iter().any(|f| f.is_primary_key) {
            // bare `id` fallback, top-level fields only
            if let Some(field) = fields
                .iter_mut()
                .find(|f| f.names.len() == 1 && f.name.eq_ignore_ascii_case("id") && f.is_normal())
            {
                field.is_primary_key = true;
            }
        }

        let mut by_name = HashMap::new();
        let mut by_column = HashMap::new();
        let mut primary = Vec::new();
        for (index, field) in fields.iter().enumerate() {
            by_name.entry(field.name.clone()).or_insert(index);
            if field.is_normal() {
                by_column.entry(field.column.clone()).or_insert(index);
            }
            if field.is_primary_key {
                primary.push(index);
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }

        let table_name = table_name.unwrap_or_else(|| table_name_for(&type_name));

        Self {
            entity,
            type_name,
            table_name,
            fields,
            by_name,
            by_column,
            primary,
            hooks,
            warnings,
            resolution_errors: Mutex::new(Vec::new()),
        }
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Declared fields in declaration order, embedded fields inlined
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Look up a field by logical name, falling back to column name
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.by_name
            .get(name)
            .or_else(|| self.by_column.get(name))
            .map(|&index| &self.fields[index])
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldMetadata> {
        self.by_column.get(column).map(|&index| &self.fields[index])
    }

    /// Key lookup used by relationship inference: matches the logical name,
    /// the column name, or the column form of the candidate.
    pub fn find_key_field(&self, candidate: &str) -> Option<&FieldMetadata> {
        let db_name = to_db_name(candidate);
        self.fields.iter().find(|field| {
            field.is_normal()
                && (field.name == candidate || field.column == candidate || field.column == db_name)
        })
    }

    pub fn primary_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.primary.iter().map(move |&index| &self.fields[index])
    }

    pub fn primary_field(&self) -> Option<&FieldMetadata> {
        self.primary.first().map(|&index| &self.fields[index])
    }

    /// Column of the first primary key, `id` when none is declared
    pub fn primary_key_column(&self) -> &str {
        self.primary_field().map(|f| f.column()).unwrap_or("id")
    }

    /// Whether every primary key of the instance is blank
    pub fn primary_key_zero(&self, instance: &JsonValue) -> bool {
        let mut primary = self.primary_fields().peekable();
        if primary.peek().is_none() {
            return true;
        }
        primary.all(|field| field.is_blank_in(instance))
    }

    /// Fields holding resolved relationships
    pub fn relationship_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.fields.iter().filter(|f| f.relationship().is_some())
    }

    pub fn hooks(&self) -> &EntityHooks {
        &self.hooks
    }

    /// Unknown annotation keys seen while parsing
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Relationship resolution failures recorded against this entity
    pub fn resolution_errors(&self) -> Vec<ModelError> {
        self.resolution_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn record_resolution_error(&self, error: ModelError) {
        warn!(entity = %self.type_name, "{}", error);
        self.resolution_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error);
    }

    /// An empty instance: every scalar null, every sequence empty
    pub fn blank_instance(&self) -> JsonValue {
        let mut instance = JsonValue::Object(Map::new());
        for field in &self.fields {
            let value = if field.is_many() { JsonValue::Array(Vec::new()) } else { JsonValue::Null };
            field.set(&mut instance, value);
        }
        instance
    }
}

fn collect_fields(
    type_name: &str,
    declared: &[super::entity::FieldDescriptor],
    parent_names: &[String],
    column_prefix: &str,
    out: &mut Vec<FieldMetadata>,
    warnings: &mut Vec<String>,
) {
    for descriptor in declared {
        let (settings, unknown) = TagSettings::parse(&descriptor.tag);
        for key in unknown {
            warnings.push(format!(
                "unknown annotation key '{}' on {}.{}",
                key, type_name, descriptor.name
            ));
        }

        let mut names = parent_names.to_vec();
        names.push(descriptor.name.clone());
        let is_ignored = settings.has("-");

        let kind = match &descriptor.shape {
            FieldShape::Scalar(kind) => FieldKind::Scalar(*kind),
            FieldShape::One(target) => FieldKind::One(*target),
            FieldShape::Many(target) => FieldKind::Many(*target),
            FieldShape::Embedded(target) => {
                if is_ignored {
                    continue;
                }
                let embedded = target.describe();
                let prefix = format!("{}{}", column_prefix, settings.get("EMBEDDED_PREFIX").unwrap_or(""));
                collect_fields(
                    embedded.type_name(),
                    &embedded.fields,
                    &names,
                    &prefix,
                    out,
                    warnings,
                );
                continue;
            }
        };

        let base_column = settings
            .value("COLUMN")
            .map(str::to_string)
            .unwrap_or_else(|| to_db_name(&descriptor.name));
        let column = format!("{}{}", column_prefix, base_column);

        // embedded keys only promote when explicitly annotated
        let is_primary_key = settings.has("PRIMARY_KEY") && !is_ignored && matches!(kind, FieldKind::Scalar(_));
        let has_default_value = settings.has("DEFAULT")
            || (settings.has("AUTO_INCREMENT") && !is_primary_key);

        out.push(FieldMetadata {
            name: descriptor.name.clone(),
            names,
            column,
            kind,
            settings,
            is_primary_key,
            is_ignored,
            has_default_value,
            is_foreign_key: AtomicBool::new(false),
            relationship: OnceLock::new(),
        });
    }
}
