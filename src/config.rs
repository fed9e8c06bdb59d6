//! Configuration management for Ratebucket.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{RateBucketError, Result};
use crate::ratelimit::LimitConfig;
use crate::store::MemoryStoreConfig;

/// Main configuration for a Ratebucket limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBucketConfig {
    /// Token bucket parameters
    #[serde(default)]
    pub limit: LimitConfig,

    /// In-memory store options
    #[serde(default)]
    pub memory_store: MemoryStoreConfig,
}

impl RateBucketConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// The limit parameters are validated here so a bad file is reported
    /// before any limiter is built.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateBucketConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateBucketError::Config(format!("Failed to parse config: {}", e)))?;
        config.limit.validate()?;
        Ok(config)
    }
}
