//! Configuration for the state cache

use serde::{Deserialize, Serialize};

/// Configuration for the state cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached records
    pub capacity: usize,

    /// Maximum number of deletion stamps kept to reject stale merges
    /// for ids that are no longer cached
    pub tombstone_capacity: usize,

    /// Enable hit/miss/eviction counters
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 5_000,
            tombstone_capacity: 5_000,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            capacity: 500,
            tombstone_capacity: 500,
            ..Default::default()
        }
    }

    /// Configuration for pages listing many thousands of items
    pub fn large() -> Self {
        Self {
            capacity: 50_000,
            tombstone_capacity: 20_000,
            ..Default::default()
        }
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    capacity: Option<usize>,
    tombstone_capacity: Option<usize>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the maximum number of cached records
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the maximum number of deletion stamps
    pub fn tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = Some(capacity);
        self
    }

    /// Enable or disable metrics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the cache configuration. The tombstone capacity follows the
    /// record capacity unless set explicitly.
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        let capacity = self.capacity.unwrap_or(defaults.capacity);

        CacheConfig {
            capacity,
            tombstone_capacity: self.tombstone_capacity.unwrap_or(capacity),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}
