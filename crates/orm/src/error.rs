//! Error types for the ORM system
//!
//! Provides error handling for schema resolution, persistence callbacks,
//! association handles and the database backends.

use std::fmt;

/// Result type alias for model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// ORM error type alias
pub type OrmError = ModelError;

/// ORM result type alias
pub type OrmResult<T> = ModelResult<T>;

/// Error types for ORM operations
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Database connection or query error
    Database(String),
    /// Record not found in the named table
    NotFound(String),
    /// Model validation failed
    Validation(String),
    /// Primary key is missing or invalid
    MissingPrimaryKey,
    /// Relationship resolution failed
    Relationship(String),
    /// Association handle failure (unknown field, unusable keys, wrong value type)
    Association(String),
    /// Serialization/deserialization error
    Serialization(String),
    /// Connection pool error
    Connection(String),
    /// Transaction error
    Transaction(String),
    /// Schema error
    Schema(String),
    /// Query building or execution error
    Query(String),
    /// A callback or entity hook reported a failure
    Callback(String),
    /// Configuration error
    Configuration(String),
    /// Several distinct errors collected during one operation
    Multiple(Vec<ModelError>),
}

impl ModelError {
    /// Whether this is the expected "no row matched" outcome of a single-row fetch.
    pub fn is_record_not_found(&self) -> bool {
        match self {
            ModelError::NotFound(_) => true,
            ModelError::Multiple(errors) => errors.iter().any(|e| e.is_record_not_found()),
            _ => false,
        }
    }

    /// Collapse a list of errors into one, dropping duplicates.
    ///
    /// Returns `None` for an empty list and the error itself when only one
    /// distinct error remains.
    pub fn combine(errors: Vec<ModelError>) -> Option<ModelError> {
        let mut distinct: Vec<ModelError> = Vec::with_capacity(errors.len());
        for error in errors {
            let flattened = match error {
                ModelError::Multiple(inner) => inner,
                other => vec![other],
            };
            for e in flattened {
                if !distinct.contains(&e) {
                    distinct.push(e);
                }
            }
        }

        match distinct.len() {
            0 => None,
            1 => distinct.pop(),
            _ => Some(ModelError::Multiple(distinct)),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Database(msg) => write!(f, "Database error: {}", msg),
            ModelError::NotFound(table) => write!(f, "Record not found in table '{}'", table),
            ModelError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ModelError::MissingPrimaryKey => write!(f, "Primary key is missing or invalid"),
            ModelError::Relationship(msg) => write!(f, "Relationship error: {}", msg),
            ModelError::Association(msg) => write!(f, "Association error: {}", msg),
            ModelError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            ModelError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ModelError::Transaction(msg) => write!(f, "Transaction error: {}", msg),
            ModelError::Schema(msg) => write!(f, "Schema error: {}", msg),
            ModelError::Query(msg) => write!(f, "Query error: {}", msg),
            ModelError::Callback(msg) => write!(f, "Callback error: {}", msg),
            ModelError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ModelError::Multiple(errors) => {
                let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", joined.join("; "))
            }
        }
    }
}

impl std::error::Error for ModelError {}

// Convert from sqlx errors
impl From<sqlx::Error> for ModelError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ModelError::NotFound("unknown".to_string()),
            other => ModelError::Database(other.to_string()),
        }
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

// Convert from anyhow errors
impl From<anyhow::Error> for ModelError {
    fn from(err: anyhow::Error) -> Self {
        ModelError::Database(err.to_string())
    }
}

/// Error types raised while resolving relationships between entities
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelationshipError {
    /// A referenced field does not exist
    #[error("Relationship not found: {0}")]
    NotFound(String),
    /// Invalid relationship configuration
    #[error("Invalid relationship configuration: {0}")]
    InvalidConfiguration(String),
    /// Foreign key and association foreign key lists differ in length
    #[error("invalid foreign keys on {entity}.{field}, should have same length ({foreign} foreign keys, {association} association foreign keys)")]
    KeyMismatch {
        entity: String,
        field: String,
        foreign: usize,
        association: usize,
    },
}

impl From<RelationshipError> for ModelError {
    fn from(err: RelationshipError) -> Self {
        ModelError::Relationship(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_deduplicates() {
        let combined = ModelError::combine(vec![
            ModelError::Query("boom".to_string()),
            ModelError::Query("boom".to_string()),
            ModelError::Validation("bad".to_string()),
        ])
        .unwrap();

        assert_eq!(combined.to_string(), "Query error: boom; Validation error: bad");
    }

    #[test]
    fn test_combine_single_and_empty() {
        assert!(ModelError::combine(Vec::new()).is_none());
        let single = ModelError::combine(vec![ModelError::MissingPrimaryKey]).unwrap();
        assert_eq!(single, ModelError::MissingPrimaryKey);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(ModelError::NotFound("users".into()).is_record_not_found());
        assert!(ModelError::Multiple(vec![
            ModelError::Query("x".into()),
            ModelError::NotFound("users".into())
        ])
        .is_record_not_found());
        assert!(!ModelError::Query("x".into()).is_record_not_found());
    }

    #[test]
    fn test_relationship_error_conversion() {
        let err: ModelError = RelationshipError::KeyMismatch {
            entity: "User".into(),
            field: "profile".into(),
            foreign: 2,
            association: 1,
        }
        .into();
        assert!(matches!(err, ModelError::Relationship(_)));
        assert!(err.to_string().contains("should have same length"));
    }
}
