//! File-Backed Storage Engine
//!
//! This module implements the storage engine for filekv: `get`, `set` and
//! `remove` of single keys (plus batch removal) against one flat data file.
//!
//! ## Design Decisions
//!
//! 1. **No cache**: every call reads the whole file, so the file is the only
//!    source of truth and nothing has to be invalidated.
//! 2. **One lock scope per call**: read, transform and write-back all happen
//!    inside a single [`FileLock::with_exclusive_access`], so two calls can
//!    never interleave their read-modify-write sequences.
//! 3. **Synchronous**: calls block on `std::fs`. The [`Executor`](crate::Executor)
//!    decides whether that happens on the calling task or on the blocking pool.
//!
//! ## Operation Flow
//!
//! ```text
//!   set("a", 1)
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   ┌─────────────┐
//! │ acquire lock │──>│ read content │──>│ codec::upsert │──>│ write back  │
//! └──────────────┘   └──────────────┘   └───────────────┘   └──────┬──────┘
//!                                                                  │
//!                                               release lock <─────┘
//! ```

use crate::error::StorageError;
use crate::storage::codec::{self, Record};
use crate::storage::lock::{FileLock, LockConfig};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// The storage engine for one data file.
///
/// Designed to be wrapped in an `Arc` and shared by every task the scheduler
/// runs; all methods take `&self`.
///
/// # Example
///
/// ```
/// use filekv::storage::{LockConfig, StorageEngine};
///
/// let dir = std::env::temp_dir().join("filekv-doc-engine");
/// std::fs::create_dir_all(&dir).unwrap();
/// let engine = StorageEngine::new(dir.join("db.txt"), LockConfig::default());
/// engine.reset().unwrap();
///
/// engine.set("name", 42).unwrap();
/// assert_eq!(engine.get("name").unwrap(), Some(42));
///
/// assert!(engine.remove("name").unwrap());
/// assert_eq!(engine.get("name").unwrap(), None);
/// ```
pub struct StorageEngine {
    lock: FileLock,

    /// Statistics: total get operations
    get_count: AtomicU64,

    /// Statistics: total set operations
    set_count: AtomicU64,

    /// Statistics: total remove operations (single or batch)
    remove_count: AtomicU64,

    /// Statistics: operations that failed
    failure_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.lock.path())
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .field("remove_count", &self.remove_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl StorageEngine {
    /// Creates an engine for `path`. The file is not touched until used.
    pub fn new(path: impl AsRef<Path>, lock_config: LockConfig) -> Self {
        Self {
            lock: FileLock::new(path.as_ref(), lock_config),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            remove_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    /// The data file path.
    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    /// Deletes any existing data file and lock marker, then creates an empty data file.
    pub fn reset(&self) -> Result<(), StorageError> {
        let path = self.path();

        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed previous data file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(path, e)),
        }

        self.lock.clear_stale_marker()?;

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;

        Ok(())
    }

    /// Gets the value stored for `key`.
    ///
    /// A missing key is `Ok(None)`; only I/O problems are errors.
    pub fn get(&self, key: &str) -> Result<Option<i64>, StorageError> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let result = self
            .lock
            .with_exclusive_access(|path| Ok(codec::find(&read(path)?, key)));
        self.track(result, "get", key)
    }

    /// Stores `value` under `key`, replacing any previous record.
    pub fn set(&self, key: &str, value: i64) -> Result<(), StorageError> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let result = self.lock.with_exclusive_access(|path| {
            let content = read(path)?;
            write(path, &codec::upsert(&content, key, value))
        });
        self.track(result, "set", key)
    }

    /// Removes the record for `key`.
    ///
    /// # Returns
    ///
    /// Returns `true` if a record was removed, `false` if there was none.
    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.remove_many(&[key]).map(|removed| removed > 0)
    }

    /// Removes the records for every key in `keys`.
    ///
    /// Keys without a record are ignored. The file is only rewritten when
    /// something was actually removed.
    ///
    /// # Returns
    ///
    /// Returns the number of records removed.
    pub fn remove_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize, StorageError> {
        self.remove_where(keys, |_| true)
    }

    /// Removes the records for the keys in `keys` for which `still_stale`
    /// returns `true`.
    ///
    /// `still_stale` is evaluated while the lock is held, so a write that is
    /// queued behind this call cannot land between the check and the removal.
    pub fn remove_where<S, F>(&self, keys: &[S], still_stale: F) -> Result<usize, StorageError>
    where
        S: AsRef<str>,
        F: Fn(&str) -> bool,
    {
        self.remove_count.fetch_add(1, Ordering::Relaxed);

        let result = self.lock.with_exclusive_access(|path| {
            let doomed: Vec<&str> = keys
                .iter()
                .map(AsRef::as_ref)
                .filter(|key| still_stale(key))
                .collect();
            if doomed.is_empty() {
                return Ok(0);
            }

            let content = read(path)?;
            let (updated, removed) = codec::remove(&content, &doomed);
            if removed > 0 {
                write(path, &updated)?;
            }
            Ok(removed)
        });

        let label = keys
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(",");
        self.track(result, "remove", &label)
    }

    /// Every record currently in the file, in file order.
    pub fn records(&self) -> Result<Vec<Record>, StorageError> {
        let result = self
            .lock
            .with_exclusive_access(|path| Ok(codec::records(&read(path)?)));
        self.track(result, "records", "*")
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            remove_ops: self.remove_count.load(Ordering::Relaxed),
            failures: self.failure_count.load(Ordering::Relaxed),
        }
    }

    fn track<T>(
        &self,
        result: Result<T, StorageError>,
        op: &'static str,
        key: &str,
    ) -> Result<T, StorageError> {
        if let Err(e) = &result {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            warn!(op = op, key = %key, error = %e, "Storage operation failed");
        }
        result
    }
}

fn read(path: &Path) -> Result<String, StorageError> {
    fs::read_to_string(path).map_err(|e| StorageError::io(path, e))
}

fn write(path: &Path, content: &str) -> Result<(), StorageError> {
    fs::write(path, content).map_err(|e| StorageError::io(path, e))
}

/// Storage engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Total get operations
    pub get_ops: u64,
    /// Total set operations
    pub set_ops: u64,
    /// Total remove operations (a batch counts once)
    pub remove_ops: u64,
    /// Operations that ended in an error
    pub failures: u64,
}
