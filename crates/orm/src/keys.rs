//! Key values
//!
//! Relationship keys are compared through [`KeyScalar`], a closed set of
//! scalar kinds with a canonical string form, so an integer key read from one
//! table matches the same number read back as a float or text elsewhere.

use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::backends::DatabaseValue;
use crate::schema::{EntityMetadata, FieldMetadata};

/// A single key component
#[derive(Debug, Clone, PartialEq)]
pub enum KeyScalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl KeyScalar {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => KeyScalar::Null,
            JsonValue::Bool(b) => KeyScalar::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    KeyScalar::Int(i)
                } else if let Some(u) = n.as_u64() {
                    KeyScalar::UInt(u)
                } else {
                    KeyScalar::Float(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(s) => KeyScalar::Text(s.clone()),
            other => KeyScalar::Text(other.to_string()),
        }
    }

    /// Canonical comparison form
    pub fn canonical(&self) -> String {
        match self {
            KeyScalar::Null => String::new(),
            KeyScalar::Bool(b) => b.to_string(),
            KeyScalar::Int(i) => i.to_string(),
            KeyScalar::UInt(u) => u.to_string(),
            KeyScalar::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", *f as i64),
            KeyScalar::Float(f) => f.to_string(),
            KeyScalar::Text(s) => s.clone(),
        }
    }

    pub fn to_database_value(&self) -> DatabaseValue {
        match self {
            KeyScalar::Null => DatabaseValue::Null,
            KeyScalar::Bool(b) => DatabaseValue::Bool(*b),
            KeyScalar::Int(i) => DatabaseValue::Int64(*i),
            KeyScalar::UInt(u) => match i64::try_from(*u) {
                Ok(i) => DatabaseValue::Int64(i),
                Err(_) => DatabaseValue::String(u.to_string()),
            },
            KeyScalar::Float(f) => DatabaseValue::Float64(*f),
            KeyScalar::Text(s) => DatabaseValue::String(s.clone()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            KeyScalar::Null => true,
            KeyScalar::Bool(b) => !b,
            KeyScalar::Int(i) => *i == 0,
            KeyScalar::UInt(u) => *u == 0,
            KeyScalar::Float(f) => *f == 0.0,
            KeyScalar::Text(s) => s.is_empty(),
        }
    }
}

/// Canonical form of a composite key
pub fn canonical_key(values: &[KeyScalar]) -> String {
    values.iter().map(KeyScalar::canonical).collect::<Vec<_>>().join("\u{1f}")
}

/// Read the named key fields of an instance
pub fn key_of(meta: &EntityMetadata, instance: &JsonValue, field_names: &[String]) -> Vec<KeyScalar> {
    field_names
        .iter()
        .map(|name| match meta.field(name) {
            Some(field) => KeyScalar::from_json(field.get(instance)),
            None => KeyScalar::Null,
        })
        .collect()
}

/// Distinct keys across instances, skipping instances whose key is entirely blank
pub fn column_values<'a, I>(meta: &EntityMetadata, instances: I, field_names: &[String]) -> Vec<Vec<KeyScalar>>
where
    I: IntoIterator<Item = &'a JsonValue>,
{
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for instance in instances {
        let key = key_of(meta, instance, field_names);
        if key.iter().all(KeyScalar::is_blank) {
            continue;
        }
        if seen.insert(canonical_key(&key)) {
            keys.push(key);
        }
    }
    keys
}

/// Bind form of a key list for an `IN (...)` condition.
///
/// Single-column keys become a flat array, composite keys an array of tuples.
pub fn keys_to_database_value(keys: &[Vec<KeyScalar>]) -> DatabaseValue {
    DatabaseValue::Array(
        keys.iter()
            .map(|key| {
                if key.len() == 1 {
                    key[0].to_database_value()
                } else {
                    DatabaseValue::Array(key.iter().map(KeyScalar::to_database_value).collect())
                }
            })
            .collect(),
    )
}

/// Zero-value test for instance fields: null, `false`, `0`, `""`, an empty
/// sequence, or an object whose values are all blank.
pub fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.values().all(is_blank),
    }
}

/// Convert a field's instance value into a bind value
pub fn field_database_value(field: &FieldMetadata, instance: &JsonValue) -> DatabaseValue {
    match field.scalar_kind() {
        Some(kind) => DatabaseValue::from_field_json(kind, field.get(instance)),
        None => DatabaseValue::from_json(field.get(instance).clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_forms_match_across_kinds() {
        assert_eq!(KeyScalar::from_json(&json!(3)).canonical(), "3");
        assert_eq!(KeyScalar::from_json(&json!(3.0)).canonical(), "3");
        assert_eq!(KeyScalar::from_json(&json!("3")).canonical(), "3");
        assert_eq!(KeyScalar::from_json(&json!(2.5)).canonical(), "2.5");
        assert_eq!(KeyScalar::from_json(&json!(u64::MAX)).canonical(), u64::MAX.to_string());
    }

    #[test]
    fn test_composite_canonical() {
        let a = canonical_key(&[KeyScalar::Int(1), KeyScalar::Text("cats".into())]);
        let b = canonical_key(&[KeyScalar::Float(1.0), KeyScalar::Text("cats".into())]);
        assert_eq!(a, b);
        assert_ne!(a, canonical_key(&[KeyScalar::Int(1)]));
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&json!(null)));
        assert!(is_blank(&json!(0)));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!([])));
        assert!(is_blank(&json!({"id": 0, "name": ""})));
        assert!(!is_blank(&json!({"id": 0, "name": "A"})));
        assert!(!is_blank(&json!([{}])));
    }

    #[test]
    fn test_keys_to_database_value() {
        let flat = keys_to_database_value(&[vec![KeyScalar::Int(1)], vec![KeyScalar::Int(2)]]);
        assert_eq!(
            flat,
            DatabaseValue::Array(vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)])
        );
        let composite = keys_to_database_value(&[vec![KeyScalar::Int(1), KeyScalar::Text("a".into())]]);
        assert_eq!(
            composite,
            DatabaseValue::Array(vec![DatabaseValue::Array(vec![
                DatabaseValue::Int64(1),
                DatabaseValue::String("a".into())
            ])])
        );
    }
}
