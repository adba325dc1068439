//! Aggregate configuration with environment overrides

use crate::batcher::BatchConfig;
use crate::cache::CacheConfig;
use crate::error::{Result, SyncError};
use crate::error_log::DEFAULT_ERROR_LOG_CAPACITY;
use crate::messaging::RetryPolicy;
use crate::service::DEFAULT_MAX_STORED_RECORDS;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Settings for both sides of the sync channel
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
    /// Entries kept by the error log
    pub error_log_capacity: usize,
    /// Records the persistent store keeps before pruning
    pub max_stored_records: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            batch: BatchConfig::default(),
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            max_stored_records: DEFAULT_MAX_STORED_RECORDS,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `VEIL_*` environment variables, after loading
    /// a `.env` file if one exists
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_var::<usize, _>(&lookup, "VEIL_CACHE_CAPACITY")? {
            config.cache = CacheConfig::builder().capacity(capacity).build();
        }
        if let Some(size) = parse_var(&lookup, "VEIL_BATCH_SIZE")? {
            config.batch.max_batch_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "VEIL_BATCH_DELAY_MS")? {
            config.batch.flush_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "VEIL_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var(&lookup, "VEIL_RETRY_INITIAL_DELAY_MS")? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "VEIL_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "VEIL_REQUEST_TIMEOUT_MS")? {
            config.retry.timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&lookup, "VEIL_ERROR_LOG_CAPACITY")? {
            config.error_log_capacity = capacity;
        }
        if let Some(max) = parse_var(&lookup, "VEIL_MAX_STORED_RECORDS")? {
            config.max_stored_records = max;
        }

        config.validate().map_err(SyncError::ConfigError)?;
        debug!("Loaded sync config: {:?}", config);
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.batch.validate()?;
        if self.error_log_capacity == 0 {
            return Err("error_log_capacity must be greater than 0".to_string());
        }
        if self.max_stored_records == 0 {
            return Err("max_stored_records must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::ConfigError(format!("{}={:?}: {}", key, raw, e))),
    }
}
