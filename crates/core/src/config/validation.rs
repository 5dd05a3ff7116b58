//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::CacheConfig;
use crate::key::SEPARATOR;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `namespace` is empty or contains the key separator `:`
    /// - `max_ttl_secs` is 0
    /// - `pool_max` is 0 or smaller than `pool_min`
    /// - `page_size` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid { field: "namespace".into(), reason: "must not be empty".into() });
        }
        if self.namespace.contains(SEPARATOR) {
            return Err(ConfigError::Invalid {
                field: "namespace".into(),
                reason: format!("must not contain '{SEPARATOR}'"),
            });
        }

        if self.max_ttl_secs == 0 {
            return Err(ConfigError::Invalid { field: "max_ttl_secs".into(), reason: "must be greater than 0".into() });
        }

        if self.pool_max == 0 {
            return Err(ConfigError::Invalid { field: "pool_max".into(), reason: "must be greater than 0".into() });
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::Invalid { field: "pool_min".into(), reason: "must not exceed pool_max".into() });
        }

        if self.page_size == 0 {
            return Err(ConfigError::Invalid { field: "page_size".into(), reason: "must be greater than 0".into() });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_namespace() {
        let config = CacheConfig { namespace: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "namespace"));
    }

    #[test]
    fn test_validate_namespace_with_separator() {
        let config = CacheConfig { namespace: "app:v1".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "namespace"));
    }

    #[test]
    fn test_validate_zero_ttl() {
        let config = CacheConfig { max_ttl_secs: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_ttl_secs"));
    }

    #[test]
    fn test_validate_pool_bounds() {
        let config = CacheConfig { pool_max: 0, pool_min: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "pool_max"));

        let config = CacheConfig { pool_min: 9, pool_max: 8, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "pool_min"));
    }

    #[test]
    fn test_validate_zero_page_size() {
        let config = CacheConfig { page_size: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "page_size"));
    }

    #[test]
    fn test_validate_edge_case_values() {
        let config = CacheConfig { max_ttl_secs: 1, pool_min: 0, pool_max: 1, page_size: 1, ..Default::default() }; // minimum valid values
        assert!(config.validate().is_ok());
    }
}
