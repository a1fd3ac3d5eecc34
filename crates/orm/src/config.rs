//! Engine configuration

use crate::backends::DatabasePoolConfig;
use crate::error::{ModelError, ModelResult};

/// Configuration for eager loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadConfig {
    /// Maximum number of keys in a single `IN (...)` query
    pub max_batch_size: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self { max_batch_size: 1000 }
    }
}

/// Top-level configuration of a [`Db`](crate::Db)
#[derive(Debug, Clone)]
pub struct OrmConfig {
    pub pool: DatabasePoolConfig,
    pub preload: PreloadConfig,
    /// Log every statement at debug level under `tether_orm::sql`
    pub log_sql: bool,
    /// Master switch for cascading saves through relationships
    pub save_associations: bool,
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            pool: DatabasePoolConfig::default(),
            preload: PreloadConfig::default(),
            log_sql: false,
            save_associations: true,
        }
    }
}

impl OrmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TETHER_LOG_SQL`, `TETHER_PRELOAD_BATCH_SIZE`
    /// and `TETHER_MAX_CONNECTIONS` when set.
    pub fn from_env() -> ModelResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("TETHER_LOG_SQL") {
            config.log_sql = parse_flag("TETHER_LOG_SQL", &value)?;
        }
        if let Ok(value) = std::env::var("TETHER_PRELOAD_BATCH_SIZE") {
            config.preload.max_batch_size = parse_number("TETHER_PRELOAD_BATCH_SIZE", &value)?;
        }
        if let Ok(value) = std::env::var("TETHER_MAX_CONNECTIONS") {
            config.pool.max_connections = parse_number("TETHER_MAX_CONNECTIONS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_pool(mut self, pool: DatabasePoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_preload_batch_size(mut self, max_batch_size: usize) -> Self {
        self.preload.max_batch_size = max_batch_size;
        self
    }

    pub fn with_log_sql(mut self, log_sql: bool) -> Self {
        self.log_sql = log_sql;
        self
    }

    pub fn with_save_associations(mut self, save_associations: bool) -> Self {
        self.save_associations = save_associations;
        self
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.preload.max_batch_size == 0 {
            return Err(ModelError::Configuration(
                "preload batch size must be greater than zero".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ModelError::Configuration(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ModelError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> ModelResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ModelError::Configuration(format!("{} is not a boolean: {}", name, other))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> ModelResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ModelError::Configuration(format!("{} is not a number: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrmConfig::default();
        assert_eq!(config.preload.max_batch_size, 1000);
        assert!(config.save_associations);
        assert!(!config.log_sql);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = OrmConfig::new().with_preload_batch_size(0);
        assert!(matches!(config.validate(), Err(ModelError::Configuration(_))));
    }

    #[test]
    fn test_parse_helpers() {
        assert!(parse_flag("X", "On").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
        assert_eq!(parse_number::<usize>("X", " 25 ").unwrap(), 25);
        assert!(parse_number::<u32>("X", "many").is_err());
    }
}
