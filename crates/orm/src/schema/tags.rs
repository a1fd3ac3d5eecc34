//! Declarative field annotations
//!
//! Fields carry a `;`-separated annotation string such as
//! `"column:user_name;size:64;not null"`. Keys are case-insensitive and
//! normalized to upper case; a value follows the first `:`.

use std::collections::BTreeMap;

/// Annotation keys the schema registry understands
pub const KNOWN_KEYS: &[&str] = &[
    "-",
    "PRIMARY_KEY",
    "AUTO_INCREMENT",
    "NOT NULL",
    "SIZE",
    "INDEX",
    "UNIQUE_INDEX",
    "UNIQUE",
    "DEFAULT",
    "COLUMN",
    "TYPE",
    "EMBEDDED",
    "EMBEDDED_PREFIX",
    "FOREIGNKEY",
    "ASSOCIATIONFOREIGNKEY",
    "MANY2MANY",
    "JOINTABLE_FOREIGNKEY",
    "ASSOCIATION_JOINTABLE_FOREIGNKEY",
    "POLYMORPHIC",
    "POLYMORPHIC_VALUE",
    "SAVE_ASSOCIATIONS",
    "ASSOCIATION_AUTOUPDATE",
    "ASSOCIATION_AUTOCREATE",
    "ASSOCIATION_SAVE_REFERENCE",
    "PRELOAD",
];

/// Parsed annotation settings of one field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSettings {
    settings: BTreeMap<String, String>,
}

impl TagSettings {
    /// Parse an annotation string, returning the settings and any keys that
    /// are not recognized.
    pub fn parse(tag: &str) -> (Self, Vec<String>) {
        let mut settings = BTreeMap::new();
        let mut unknown = Vec::new();

        for part in tag.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once(':') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (part, ""),
            };
            let key = key.to_uppercase();
            if !KNOWN_KEYS.contains(&key.as_str()) {
                unknown.push(key.clone());
            }
            settings.insert(key, value.to_string());
        }

        (Self { settings }, unknown)
    }

    /// Whether the key is present, with or without a value
    pub fn has(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    /// Value of a key; `None` when absent, `Some("")` for flags
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Non-empty value of a key
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Comma-separated list value, empty when absent
    pub fn list(&self, key: &str) -> Vec<String> {
        self.value(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or overwrite a setting
    pub fn set(&mut self, key: &str, value: &str) {
        self.settings.insert(key.to_uppercase(), value.to_string());
    }

    /// Numeric `SIZE` value
    pub fn size(&self) -> Option<usize> {
        self.value("SIZE").and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_and_values() {
        let (tags, unknown) = TagSettings::parse("column:user_name; size:64;not null;primary_key");
        assert!(unknown.is_empty());
        assert_eq!(tags.get("COLUMN"), Some("user_name"));
        assert_eq!(tags.size(), Some(64));
        assert!(tags.has("NOT NULL"));
        assert_eq!(tags.get("PRIMARY_KEY"), Some(""));
        assert!(!tags.has("INDEX"));
    }

    #[test]
    fn test_value_keeps_text_after_first_colon() {
        let (tags, _) = TagSettings::parse("default:'a:b'");
        assert_eq!(tags.value("DEFAULT"), Some("'a:b'"));
    }

    #[test]
    fn test_lists() {
        let (tags, _) = TagSettings::parse("foreignkey:owner_id, owner_kind;many2many:user_languages");
        assert_eq!(tags.list("FOREIGNKEY"), vec!["owner_id", "owner_kind"]);
        assert!(tags.list("ASSOCIATIONFOREIGNKEY").is_empty());
        assert_eq!(tags.value("MANY2MANY"), Some("user_languages"));
    }

    #[test]
    fn test_unknown_keys_are_reported() {
        let (tags, unknown) = TagSettings::parse("colum:name;Index");
        assert_eq!(unknown, vec!["COLUM".to_string()]);
        assert!(tags.has("INDEX"));
    }

    #[test]
    fn test_ignore_marker() {
        let (tags, unknown) = TagSettings::parse("-");
        assert!(unknown.is_empty());
        assert!(tags.has("-"));
    }
}
