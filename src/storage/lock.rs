//! Lock-Guarded File Access
//!
//! Every read-modify-write of the data file runs inside
//! [`FileLock::with_exclusive_access`]. Two layers provide the exclusion:
//!
//! 1. **Path mutex**: a process-wide registry hands out one mutex per data
//!    file path, so operations from any number of stores in this process
//!    that share a path are serialized.
//! 2. **Lock marker** (optional): a zero-byte `<path>-lock` file created with
//!    `create_new`. Its existence means "owned". Waiters spin with a fixed
//!    sleep until they win the create. This only matters when another
//!    process follows the same convention.
//!
//! ```text
//!   op A ──┐                    ┌── op B (blocked on path mutex)
//!          ▼                    │
//!   ┌─────────────┐    ┌────────┴────────┐    ┌──────────────┐
//!   │ path mutex  │───>│ create marker   │───>│ run operation│
//!   └─────────────┘    │ (spin if exists)│    └──────┬───────┘
//!                      └─────────────────┘           │
//!                         drop: remove marker <──────┘
//! ```
//!
//! Both layers are released by drop guards, so an operation that returns an
//! error or panics still gives the file back.

use crate::error::StorageError;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Suffix appended to the data file path to form the lock marker path.
pub const LOCK_SUFFIX: &str = "-lock";

/// Settings for [`FileLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Also create a `<path>-lock` marker file while the lock is held
    pub use_marker_file: bool,

    /// Sleep between attempts to create the marker (default: 5ms)
    pub retry_interval: Duration,

    /// Give up waiting for the marker after this long (default: never)
    pub max_wait: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            use_marker_file: true,
            retry_interval: Duration::from_millis(5),
            max_wait: None,
        }
    }
}

type PathMutex = Arc<Mutex<()>>;

fn registry() -> &'static Mutex<HashMap<PathBuf, PathMutex>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, PathMutex>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the mutex shared by everyone in this process using `path`.
fn path_mutex(path: &Path) -> PathMutex {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(map.entry(key).or_default())
}

/// Returns the lock marker path for a data file.
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Mutually exclusive access to one file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    marker: Option<PathBuf>,
    local: PathMutex,
    config: LockConfig,
}

impl FileLock {
    /// Creates a lock for `path`. Nothing is touched on disk until the lock is used.
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        let path = path.into();
        let marker = config.use_marker_file.then(|| marker_path(&path));
        let local = path_mutex(&path);

        Self {
            path,
            marker,
            local,
            config,
        }
    }

    /// The guarded file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The marker file, if marker files are enabled.
    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }

    /// Runs `operation` while no other holder of this path's lock is inside theirs.
    ///
    /// Waiting for the marker is a spin with fixed sleeps, so waiters are not
    /// served in any particular order. Errors from `operation` propagate after
    /// the lock has been released.
    pub fn with_exclusive_access<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Path) -> Result<T, StorageError>,
    {
        let _local = self.lock_local();
        let _marker = self.acquire_marker()?;
        operation(&self.path)
    }

    fn lock_local(&self) -> MutexGuard<'_, ()> {
        // A panic inside an earlier operation poisons the mutex but leaves
        // nothing half-done in memory; the file itself is the only state.
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_marker(&self) -> Result<Option<MarkerGuard<'_>>, StorageError> {
        let Some(marker) = self.marker.as_deref() else {
            return Ok(None);
        };

        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(marker) {
                Ok(_) => {
                    if attempts > 0 {
                        trace!(
                            marker = %marker.display(),
                            attempts = attempts,
                            waited_ms = started.elapsed().as_millis(),
                            "Lock marker acquired after contention"
                        );
                    }
                    return Ok(Some(MarkerGuard { path: marker }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if let Some(max_wait) = self.config.max_wait {
                        if waited >= max_wait {
                            return Err(StorageError::LockTimeout {
                                path: marker.to_path_buf(),
                                waited,
                            });
                        }
                    }
                    attempts += 1;
                    std::thread::sleep(self.config.retry_interval);
                }
                Err(e) => return Err(StorageError::io(marker, e)),
            }
        }
    }

    /// Removes a leftover marker. Used when the data file is reset.
    pub fn clear_stale_marker(&self) -> Result<(), StorageError> {
        let marker = marker_path(&self.path);
        match std::fs::remove_file(&marker) {
            Ok(()) => {
                debug!(marker = %marker.display(), "Removed stale lock marker");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(marker, e)),
        }
    }
}

/// Removes the marker file on drop.
struct MarkerGuard<'a> {
    path: &'a Path,
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        // Someone else may already have cleared it.
        if let Err(e) = std::fs::remove_file(self.path) {
            debug!(marker = %self.path.display(), error = %e, "Lock marker already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path_appends_suffix() {
        assert_eq!(
            marker_path(Path::new("/tmp/db.txt")),
            PathBuf::from("/tmp/db.txt-lock")
        );
    }

    #[test]
    fn test_marker_exists_only_during_operation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        let lock = FileLock::new(&path, LockConfig::default());
        let marker = marker_path(&path);

        let seen = lock
            .with_exclusive_access(|_| Ok(marker.exists()))
            .unwrap();

        assert!(seen);
        assert!(!marker.exists());
    }

    #[test]
    fn test_marker_released_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        let lock = FileLock::new(&path, LockConfig::default());

        let result: Result<(), _> = lock.with_exclusive_access(|p| {
            Err(StorageError::io(
                p,
                std::io::Error::new(ErrorKind::Other, "boom"),
            ))
        });

        assert!(result.is_err());
        assert!(!marker_path(&path).exists());

        // The lock is usable again
        assert!(lock.with_exclusive_access(|_| Ok(())).is_ok());
    }

    #[test]
    fn test_no_marker_when_disabled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        let config = LockConfig {
            use_marker_file: false,
            ..Default::default()
        };
        let lock = FileLock::new(&path, config);
        assert!(lock.marker().is_none());

        let seen = lock
            .with_exclusive_access(|_| Ok(marker_path(&path).exists()))
            .unwrap();
        assert!(!seen);
    }

    #[test]
    fn test_stale_marker_times_out_when_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        std::fs::File::create(marker_path(&path)).unwrap();

        let config = LockConfig {
            retry_interval: Duration::from_millis(2),
            max_wait: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let lock = FileLock::new(&path, config);

        let result = lock.with_exclusive_access(|_| Ok(()));
        assert!(matches!(result, Err(StorageError::LockTimeout { .. })));
    }

    #[test]
    fn test_waiter_proceeds_once_marker_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        let marker = marker_path(&path);
        std::fs::File::create(&marker).unwrap();

        let lock = FileLock::new(&path, LockConfig::default());
        let clearer = {
            let marker = marker.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                std::fs::remove_file(marker).unwrap();
            })
        };

        let started = Instant::now();
        lock.with_exclusive_access(|_| Ok(())).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        clearer.join().unwrap();
    }

    #[test]
    fn test_clear_stale_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        std::fs::File::create(marker_path(&path)).unwrap();

        let lock = FileLock::new(&path, LockConfig::default());
        lock.clear_stale_marker().unwrap();
        assert!(!marker_path(&path).exists());

        // Clearing again is fine
        lock.clear_stale_marker().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.txt");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                // Separate FileLock values for the same path share the path mutex
                let lock = FileLock::new(&path, LockConfig::default());
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        lock.with_exclusive_access(|_| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!marker_path(&path).exists());
    }
}
