//! Store Configuration
//!
//! The store consumes a [`StoreConfig`]; building one (from flags, files or
//! code) is up to the caller. The binary in `main.rs` builds it from
//! command-line arguments.

use crate::error::ConfigError;
use crate::expiry::ExpiryConfig;
use crate::storage::LockConfig;
use std::path::PathBuf;

/// Data file used when nothing else is configured.
pub const DEFAULT_DATA_FILE: &str = "db.txt";

/// Concurrency used when the host's parallelism cannot be determined.
const FALLBACK_CONCURRENCY: usize = 2;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the flat data file
    pub data_file_path: PathBuf,

    /// Maximum number of storage operations in flight at once
    pub concurrency: usize,

    /// Run file operations on the calling task instead of the blocking pool
    ///
    /// Inline operations block the tokio worker they run on, including while
    /// they wait for the file lock or spin on another process's marker. On a
    /// busy store that can hold up timers and the expiry sweeper; turn this
    /// off when the lock is expected to be contended.
    pub execute_inline: bool,

    /// How the data file is locked
    pub lock: LockConfig,

    /// Which expiry mechanisms are active and how they are tuned
    pub expiry: ExpiryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file_path: PathBuf::from(DEFAULT_DATA_FILE),
            concurrency: default_concurrency(),
            execute_inline: true,
            lock: LockConfig::default(),
            expiry: ExpiryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Creates a default configuration for the given data file.
    pub fn new(data_file_path: impl Into<PathBuf>) -> Self {
        Self {
            data_file_path: data_file_path.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_execute_inline(mut self, inline: bool) -> Self {
        self.execute_inline = inline;
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryConfig) -> Self {
        self.expiry = expiry;
        self
    }

    /// Checks the invariants the store relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_file_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.lock.retry_interval.is_zero() {
            return Err(ConfigError::ZeroRetryInterval);
        }
        if self.expiry.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

/// The host's available parallelism, or a small fallback.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.concurrency >= 1);
        assert_eq!(config.data_file_path, PathBuf::from(DEFAULT_DATA_FILE));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = StoreConfig::new("db.txt").with_concurrency(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let lock = LockConfig {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        let config = StoreConfig::new("db.txt").with_lock(lock);
        assert_eq!(config.validate(), Err(ConfigError::ZeroRetryInterval));
    }

    #[test]
    fn test_empty_path_rejected() {
        let config = StoreConfig::new("");
        assert_eq!(config.validate(), Err(ConfigError::EmptyPath));
    }
}
