//! Naming conventions
//!
//! Pure string transformations used to derive table, column and key names
//! from Rust type and field names.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// Initialisms normalized to title case before snake-casing, so `UserID`
/// becomes `user_id` rather than `user_i_d`. Earlier entries win when two
/// start at the same position.
static COMMON_INITIALISMS: &[&str] = &[
    "API", "ASCII", "CPU", "CSS", "DNS", "EOF", "GUID", "HTML", "HTTP", "HTTPS", "ID", "IP",
    "JSON", "LHS", "QPS", "RAM", "RHS", "RPC", "SLA", "SMTP", "SSH", "TLS", "TTL", "UID",
    "UI", "UUID", "URI", "URL", "UTF8", "VM", "XML", "XSRF", "XSS",
];

static DB_NAME_CACHE: Lazy<DashMap<String, String>> = Lazy::new(DashMap::new);

/// Convert a type or field name to its snake_case database form.
///
/// Results are memoized process-wide.
pub fn to_db_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    if let Some(cached) = DB_NAME_CACHE.get(name) {
        return cached.clone();
    }

    let converted = snake_case(&replace_initialisms(name));
    DB_NAME_CACHE.insert(name.to_string(), converted.clone());
    converted
}

fn replace_initialisms(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    'outer: while !rest.is_empty() {
        for initialism in COMMON_INITIALISMS.iter() {
            if let Some(tail) = rest.strip_prefix(initialism) {
                let mut chars = initialism.chars();
                if let Some(first) = chars.next() {
                    out.push(first);
                    out.extend(chars.map(|c| c.to_ascii_lowercase()));
                }
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn snake_case(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    if chars.is_empty() {
        return out;
    }

    let mut last_upper = false;
    let mut cur_upper = chars[0].is_ascii_uppercase();
    for i in 0..chars.len() - 1 {
        let c = chars[i];
        let next = chars[i + 1];
        let next_upper = next.is_ascii_uppercase();
        let next_digit = next.is_ascii_digit();

        if cur_upper {
            if last_upper && (next_upper || next_digit) {
                out.push(c.to_ascii_lowercase());
            } else {
                if i > 0 && chars[i - 1] != '_' && next != '_' {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            }
        } else {
            out.push(c);
        }
        last_upper = cur_upper;
        cur_upper = next_upper;
    }

    let last = chars[chars.len() - 1];
    if cur_upper {
        if !last_upper && chars.len() > 1 {
            out.push('_');
        }
        out.push(last.to_ascii_lowercase());
    } else {
        out.push(last);
    }
    out
}

struct Inflection {
    find: Regex,
    replace: &'static str,
}

static UNCOUNTABLE: &[&str] = &[
    "equipment", "information", "rice", "money", "species", "series", "fish", "sheep", "jeans",
    "police",
];

static IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("child", "children"),
    ("sex", "sexes"),
    ("move", "moves"),
    ("mombie", "mombies"),
];

static PLURAL_RULES: Lazy<Vec<Inflection>> = Lazy::new(|| {
    // first match wins
    let rules: &[(&str, &str)] = &[
        (r"(?i)(quiz)$", "${1}zes"),
        (r"(?i)^(oxen)$", "${1}"),
        (r"(?i)^(ox)$", "${1}en"),
        (r"(?i)(matr|vert|ind)(?:ix|ex)$", "${1}ices"),
        (r"(?i)(x|ch|ss|sh)$", "${1}es"),
        (r"(?i)([^aeiouy]|qu)y$", "${1}ies"),
        (r"(?i)(hive)$", "${1}s"),
        (r"(?i)(?:([^f])fe|([lr])f)$", "${1}${2}ves"),
        (r"(?i)sis$", "ses"),
        (r"(?i)([ti])a$", "${1}a"),
        (r"(?i)([ti])um$", "${1}a"),
        (r"(?i)(buffal|tomat)o$", "${1}oes"),
        (r"(?i)(bu)s$", "${1}ses"),
        (r"(?i)(alias|status)$", "${1}es"),
        (r"(?i)(octop|vir)i$", "${1}i"),
        (r"(?i)(octop|vir)us$", "${1}i"),
        (r"(?i)^(ax|test)is$", "${1}es"),
        (r"(?i)s$", "s"),
        (r"$", "s"),
    ];
    rules
        .iter()
        .filter_map(|(find, replace)| {
            Regex::new(find).ok().map(|find| Inflection { find, replace })
        })
        .collect()
});

/// English plural of a (snake_case) word. Only the last `_` segment is inflected.
pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }

    let (head, last) = match word.rfind('_') {
        Some(pos) => (&word[..=pos], &word[pos + 1..]),
        None => ("", word),
    };
    let lower = last.to_lowercase();

    if UNCOUNTABLE.contains(&lower.as_str()) {
        return word.to_string();
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(singular, _)| *singular == lower) {
        return format!("{}{}", head, plural);
    }
    if IRREGULAR.iter().any(|(_, plural)| *plural == lower) {
        return word.to_string();
    }

    for rule in PLURAL_RULES.iter() {
        if rule.find.is_match(last) {
            let replaced = rule.find.replace(last, rule.replace);
            return format!("{}{}", head, replaced);
        }
    }
    format!("{}s", word)
}

/// Default table name for a Rust type name
pub fn table_name_for(type_name: &str) -> String {
    pluralize(&to_db_name(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_db_name() {
        assert_eq!(to_db_name("User"), "user");
        assert_eq!(to_db_name("UserLanguage"), "user_language");
        assert_eq!(to_db_name("UserID"), "user_id");
        assert_eq!(to_db_name("HTTPServer"), "http_server");
        assert_eq!(to_db_name("ProfileURL"), "profile_url");
        assert_eq!(to_db_name("category_id"), "category_id");
        assert_eq!(to_db_name("Address1"), "address1");
        assert_eq!(to_db_name(""), "");
    }

    #[test]
    fn test_to_db_name_is_cached() {
        let first = to_db_name("CachedTypeName");
        assert!(DB_NAME_CACHE.contains_key("CachedTypeName"));
        assert_eq!(first, to_db_name("CachedTypeName"));
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("user"), "users");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("toy"), "toys");
        assert_eq!(pluralize("address"), "addresses");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("person"), "people");
        assert_eq!(pluralize("user_language"), "user_languages");
        assert_eq!(pluralize("sheep"), "sheep");
        assert_eq!(pluralize("status"), "statuses");
        assert_eq!(pluralize("wolf"), "wolves");
        assert_eq!(pluralize("knife"), "knives");
    }

    #[test]
    fn test_table_name_for() {
        assert_eq!(table_name_for("Category"), "categories");
        assert_eq!(table_name_for("CreditCard"), "credit_cards");
        assert_eq!(table_name_for("Dog"), "dogs");
    }
}
