//! Error Types
//!
//! Errors are split by layer. [`StorageError`] covers everything that can go
//! wrong while touching the data file; the store facade folds these into
//! `false` / `None` results plus a metrics message. [`StoreError`] is what the
//! facade itself returns, and only for faults the caller has to fix
//! (using the store before `init`, passing a key the line format cannot hold).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of a single storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading, writing or removing a file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A lock marker stayed in place longer than the configured maximum wait
    #[error("lock marker {path} still held after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The isolated execution context crashed or was cancelled
    #[error("isolated execution failed: {0}")]
    Isolated(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by the [`Store`](crate::Store) facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `set` / `get` called before `init`
    #[error("store is not initialized")]
    NotInitialized,

    /// Key cannot be represented in the `key:value` line format
    #[error("invalid key {0:?}: keys must be non-empty and contain no ':' or whitespace")]
    InvalidKey(String),

    /// Configuration rejected at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Resetting the data file during `init` failed
    #[error("failed to initialize data file: {0}")]
    Init(#[source] StorageError),

    /// A whole-file read (`snapshot`) failed
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),
}

/// Problems found by [`StoreConfig::validate`](crate::StoreConfig::validate).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("lock retry interval must be non-zero")]
    ZeroRetryInterval,

    #[error("sweep interval must be non-zero")]
    ZeroSweepInterval,

    #[error("data file path is empty")]
    EmptyPath,
}
