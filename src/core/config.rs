use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::errors::{Result, SchedulerError};

/// Configuration parameter enabling parallel execution
pub const PARALLEL_ENABLED_KEY: &str = "treeexec.parallel.enabled";
/// Configuration parameter sizing the worker pool
pub const POOL_SIZE_KEY: &str = "treeexec.parallel.pool_size";

/// Environment variable mirrors of the parameters above
pub const PARALLEL_ENABLED_ENV: &str = "TREEEXEC_PARALLEL_ENABLED";
pub const POOL_SIZE_ENV: &str = "TREEEXEC_POOL_SIZE";

/// Scheduler configuration supplied by the configuration collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run independent units concurrently
    pub parallel_enabled: bool,
    /// Maximum number of units running their own work at once
    pub pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: true,
            pool_size: num_cpus::get().max(1),
        }
    }
}

impl SchedulerConfig {
    /// Create a new builder for SchedulerConfig
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// Single worker, same code path as the parallel mode
    pub fn sequential() -> Self {
        Self {
            parallel_enabled: false,
            pool_size: 1,
        }
    }

    pub fn parallel(pool_size: usize) -> Self {
        Self {
            parallel_enabled: true,
            pool_size,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(SchedulerError::configuration_field(
                "pool_size must be greater than 0",
                "pool_size",
            ));
        }
        Ok(())
    }

    /// Pool size actually used; disabled parallelism forces a single worker
    pub fn effective_pool_size(&self) -> usize {
        if self.parallel_enabled {
            self.pool_size
        } else {
            1
        }
    }

    /// Build from string configuration parameters.
    ///
    /// Missing keys fall back to [`SchedulerConfig::default`].
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = params.get(PARALLEL_ENABLED_KEY) {
            config.parallel_enabled = parse_bool(PARALLEL_ENABLED_KEY, raw)?;
        }
        if let Some(raw) = params.get(POOL_SIZE_KEY) {
            config.pool_size = raw.trim().parse().map_err(|_| {
                SchedulerError::configuration_field(
                    format!("invalid pool size '{raw}'"),
                    POOL_SIZE_KEY,
                )
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build from `TREEEXEC_PARALLEL_ENABLED` / `TREEEXEC_POOL_SIZE`
    pub fn from_env() -> Result<Self> {
        let mut params = HashMap::new();
        if let Ok(value) = std::env::var(PARALLEL_ENABLED_ENV) {
            params.insert(PARALLEL_ENABLED_KEY.to_string(), value);
        }
        if let Ok(value) = std::env::var(POOL_SIZE_ENV) {
            params.insert(POOL_SIZE_KEY.to_string(), value);
        }
        Self::from_parameters(&params)
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(SchedulerError::configuration_field(
            format!("expected a boolean, got '{raw}'"),
            field,
        )),
    }
}

/// Builder for SchedulerConfig
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn parallel_enabled(mut self, enabled: bool) -> Self {
        self.config.parallel_enabled = enabled;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.parallel_enabled);
        assert!(config.pool_size >= 1);
    }

    #[test]
    fn test_disabled_parallelism_forces_single_worker() {
        let config = SchedulerConfig::builder()
            .parallel_enabled(false)
            .pool_size(8)
            .build()
            .unwrap();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.effective_pool_size(), 1);
        assert_eq!(SchedulerConfig::parallel(4).effective_pool_size(), 4);
    }

    #[test]
    fn test_zero_pool_rejected() {
        let err = SchedulerConfig::builder().pool_size(0).build().unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Configuration { field: Some(ref f), .. } if f == "pool_size"
        ));
    }

    #[test]
    fn test_from_parameters() {
        let mut params = HashMap::new();
        params.insert(PARALLEL_ENABLED_KEY.to_string(), "TRUE".to_string());
        params.insert(POOL_SIZE_KEY.to_string(), " 4 ".to_string());
        let config = SchedulerConfig::from_parameters(&params).unwrap();
        assert_eq!(config, SchedulerConfig::parallel(4));

        params.insert(PARALLEL_ENABLED_KEY.to_string(), "false".to_string());
        let config = SchedulerConfig::from_parameters(&params).unwrap();
        assert!(!config.parallel_enabled);
        assert_eq!(config.effective_pool_size(), 1);
    }

    #[test]
    fn test_from_parameters_errors() {
        let mut params = HashMap::new();
        params.insert(PARALLEL_ENABLED_KEY.to_string(), "maybe".to_string());
        assert!(SchedulerConfig::from_parameters(&params).is_err());

        let mut params = HashMap::new();
        params.insert(POOL_SIZE_KEY.to_string(), "four".to_string());
        assert!(SchedulerConfig::from_parameters(&params).is_err());

        params.insert(POOL_SIZE_KEY.to_string(), "0".to_string());
        assert!(SchedulerConfig::from_parameters(&params).is_err());
    }
}
