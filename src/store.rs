//! Store Facade
//!
//! [`Store`] is the public get/set surface. It owns one of each component and
//! routes every call through them:
//!
//! ```text
//!            set(key, value, ttl)                 get(key)
//!                    │                               │
//!      take a new write epoch              tracked deadline passed?
//!      cancel pending expiry timer           │yes            │no
//!      record deadline (tracked)             ▼               ▼
//!                    │                 queue removal    ┌──────────┐
//!                    ▼                 answer None      │ read task│
//!             ┌──────────────┐                          └────┬─────┘
//!             │  write task  │                               │
//!             └──────┬───────┘                               │
//!                    ▼                                       ▼
//!        TaskScheduler (≤ N running) ──> Executor ──> StorageEngine ──> data file
//!                    │
//!      on success, if still the latest write:
//!      arm expiry timer (scheduled)
//! ```
//!
//! Each call is bracketed by a metrics record that is closed by the task's
//! completion. Storage failures come back as `false` / `None`, with the
//! reason in the metrics message; only misuse of the API is an `Err`.
//!
//! A queued removal cannot be withdrawn, so it re-checks each key once the
//! file is locked: timer removals need the key's write epoch to be unchanged,
//! passive and swept removals need its deadline to still be in the past. A
//! `set` issued after the removal was queued therefore always survives it.

use crate::config::StoreConfig;
use crate::error::{StorageError, StoreError};
use crate::executor::Executor;
use crate::expiry::{Evictor, ExpirySweeper, ExpiryTracker, WriteEpochs};
use crate::metrics::{Metrics, OperationKind};
use crate::scheduler::TaskScheduler;
use crate::storage::{Record, StorageEngine, StorageStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Message recorded when a task disappeared without completing.
const ABORTED: &str = "task aborted before completion";

/// Checks that `key` fits the `key:value` line format.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key
            .chars()
            .any(|c| c == ':' || c.is_whitespace() || c.is_control());
    if invalid {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

fn failure_message<T>(result: &Result<T, StorageError>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

/// What must still hold, once the file is locked, for a queued removal to
/// go ahead. Keys written since the removal was queued are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    /// The key's tracked deadline has passed
    Deadline,
    /// No `set` on the key has begun since this epoch
    Epoch(u64),
}

/// Submits key removals to the scheduler.
///
/// Shared by expiry timers, passive eviction and the sweeper.
#[derive(Clone)]
struct Remover {
    engine: Arc<StorageEngine>,
    executor: Executor,
    scheduler: TaskScheduler,
    tracker: Arc<ExpiryTracker>,
    epochs: Arc<WriteEpochs>,
}

impl Remover {
    /// Queues removal of `keys`; the receiver yields `true` on success.
    ///
    /// Only keys that are still stale when the removal runs are removed.
    /// Deadlines of keys that are still expired are dropped from the tracker
    /// once the file has been rewritten.
    fn submit(&self, keys: Vec<String>, staleness: Staleness) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let executor = self.executor;
        let tracker = Arc::clone(&self.tracker);
        let check_tracker = Arc::clone(&self.tracker);
        let epochs = Arc::clone(&self.epochs);
        let op_keys = keys.clone();

        let still_stale = move |key: &str| match staleness {
            Staleness::Deadline => check_tracker.is_expired(key),
            Staleness::Epoch(epoch) => epochs.is_latest(key, epoch),
        };

        self.scheduler.submit(
            async move {
                executor
                    .run(move || engine.remove_where(&op_keys, still_stale))
                    .await
            },
            move |result| {
                let success = match result {
                    Ok(removed) => {
                        trace!(keys = ?keys, removed = removed, "Expired keys removed");
                        tracker.forget_expired(&keys, Instant::now());
                        true
                    }
                    Err(e) => {
                        warn!(keys = ?keys, error = %e, "Failed to remove expired keys");
                        false
                    }
                };
                let _ = tx.send(success);
            },
        );

        rx
    }
}

impl Evictor for Remover {
    async fn evict(&self, keys: Vec<String>) -> bool {
        self.submit(keys, Staleness::Deadline)
            .await
            .unwrap_or(false)
    }
}

/// A key-value store over a single flat file.
///
/// # Example
///
/// ```
/// use filekv::{Store, StoreConfig};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), filekv::StoreError> {
/// let dir = std::env::temp_dir().join("filekv-doc-store");
/// std::fs::create_dir_all(&dir).unwrap();
///
/// let store = Store::new(StoreConfig::new(dir.join("db.txt")).with_concurrency(4))?;
/// store.init().await?;
///
/// assert!(store.set("a", 1).await?);
/// assert_eq!(store.get("a").await?, Some(1));
///
/// store.set_with_ttl("session", 7, Some(Duration::from_secs(60))).await?;
/// assert_eq!(store.get("session").await?, Some(7));
/// # Ok(())
/// # }
/// ```
pub struct Store {
    config: StoreConfig,
    engine: Arc<StorageEngine>,
    executor: Executor,
    scheduler: TaskScheduler,
    metrics: Arc<Metrics>,
    tracker: Arc<ExpiryTracker>,
    epochs: Arc<WriteEpochs>,
    sweeper: Mutex<Option<ExpirySweeper>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.engine.path())
            .field("initialized", &self.is_initialized())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Store {
    /// Creates a store. Nothing is touched on disk until [`init`](Self::init).
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let engine = Arc::new(StorageEngine::new(
            &config.data_file_path,
            config.lock.clone(),
        ));
        let scheduler =
            TaskScheduler::with_cancel_policy(config.concurrency, config.expiry.cancel_policy);

        Ok(Self {
            executor: Executor::from_inline_flag(config.execute_inline),
            engine,
            scheduler,
            metrics: Arc::new(Metrics::new()),
            tracker: Arc::new(ExpiryTracker::new()),
            epochs: Arc::new(WriteEpochs::new()),
            sweeper: Mutex::new(None),
            initialized: AtomicBool::new(false),
            config,
        })
    }

    /// Resets the data file (removing any stale file and lock marker) and
    /// makes the store usable.
    ///
    /// Calling it again starts over with an empty file; pending expiry
    /// timers and deadlines are dropped.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.stop_expiry();
        self.tracker.clear();
        self.epochs.clear();

        let engine = Arc::clone(&self.engine);
        self.executor
            .run(move || engine.reset())
            .await
            .map_err(StoreError::Init)?;

        self.initialized.store(true, Ordering::Release);
        info!(
            path = %self.engine.path().display(),
            concurrency = self.scheduler.limit(),
            inline = self.config.execute_inline,
            expiry = ?self.config.expiry.mode,
            "Store initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn remover(&self) -> Remover {
        Remover {
            engine: Arc::clone(&self.engine),
            executor: self.executor,
            scheduler: self.scheduler.clone(),
            tracker: Arc::clone(&self.tracker),
            epochs: Arc::clone(&self.epochs),
        }
    }

    /// Stores `value` under `key` with no expiry.
    pub async fn set(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        self.set_with_ttl(key, value, None).await
    }

    /// Stores `value` under `key`, expiring after `ttl` (`None` = never).
    ///
    /// # Returns
    ///
    /// Returns `Ok(true)` once the write reached the file, `Ok(false)` if it
    /// failed (the reason is in the metrics log).
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.ensure_initialized()?;
        validate_key(key)?;

        let mode = self.config.expiry.mode;

        // From here on, removals queued for older writes skip this key
        let epoch = self.epochs.begin(key);

        if mode.uses_timers() {
            self.scheduler.cancel_deferred(key);
        }
        if mode.uses_tracker() && self.tracker.record(key, ttl) {
            self.start_sweeper();
        }

        let metric = self.metrics.begin(OperationKind::Set);
        let (tx, rx) = oneshot::channel();

        let engine = Arc::clone(&self.engine);
        let executor = self.executor;
        let op_key = key.to_string();

        let key = key.to_string();
        let metrics = Arc::clone(&self.metrics);
        let epochs = Arc::clone(&self.epochs);
        let scheduler = self.scheduler.clone();
        let remover = self.remover();
        let arm_timer = mode.uses_timers();

        self.scheduler.submit(
            async move { executor.run(move || engine.set(&op_key, value)).await },
            move |result| {
                let success = result.is_ok();
                metrics.end(metric, success, failure_message(&result));

                if let Some(ttl) = ttl.filter(|_| success && arm_timer) {
                    // Armed under the epoch lock so a newer set either sees
                    // this timer and cancels it, or prevents it entirely
                    epochs.run_if_latest(&key, epoch, || {
                        let expired_key = key.clone();
                        scheduler.schedule_deferred(key.as_str(), ttl, move || {
                            let _ = remover.submit(vec![expired_key], Staleness::Epoch(epoch));
                        });
                    });
                }

                let _ = tx.send(success);
            },
        );

        match rx.await {
            Ok(success) => Ok(success),
            Err(_) => {
                self.metrics.end(metric, false, ABORTED);
                Ok(false)
            }
        }
    }

    /// Gets the value stored under `key`.
    ///
    /// Returns `Ok(None)` for a missing or expired key and also when the read
    /// failed (the reason is in the metrics log).
    pub async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.ensure_initialized()?;
        validate_key(key)?;

        let metric = self.metrics.begin(OperationKind::Get);

        if self.config.expiry.mode.uses_tracker() && self.tracker.is_expired(key) {
            debug!(key = %key, "Key expired, evicting on read");
            // Cleanup runs in the background; the answer does not wait for it
            let _ = self
                .remover()
                .submit(vec![key.to_string()], Staleness::Deadline);
            self.metrics.end(metric, true, "expired");
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let executor = self.executor;
        let op_key = key.to_string();
        let metrics = Arc::clone(&self.metrics);

        self.scheduler.submit(
            async move { executor.run(move || engine.get(&op_key)).await },
            move |result| {
                metrics.end(metric, result.is_ok(), failure_message(&result));
                let _ = tx.send(result.unwrap_or(None));
            },
        );

        match rx.await {
            Ok(value) => Ok(value),
            Err(_) => {
                self.metrics.end(metric, false, ABORTED);
                Ok(None)
            }
        }
    }

    /// Every record currently in the data file.
    pub async fn snapshot(&self) -> Result<Vec<Record>, StoreError> {
        self.ensure_initialized()?;

        let engine = Arc::clone(&self.engine);
        let executor = self.executor;
        let rx = self
            .scheduler
            .submit_for_result(async move { executor.run(move || engine.records()).await });

        match rx.await {
            Ok(result) => result.map_err(StoreError::Storage),
            Err(_) => Err(StoreError::Storage(StorageError::Isolated(
                ABORTED.to_string(),
            ))),
        }
    }

    /// Waits until no storage operation is queued or running.
    pub async fn idle(&self) {
        self.scheduler.idle().await;
    }

    fn start_sweeper(&self) {
        let sweeper = ExpirySweeper::start(
            Arc::clone(&self.tracker),
            self.remover(),
            self.config.expiry.sweep_interval,
        );
        // Replaces (and stops) a sweeper that already went idle
        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
    }

    fn stop_expiry(&self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.stop();
        }
        self.tracker.disarm();
        let cancelled = self.scheduler.cancel_all_deferred();
        if cancelled > 0 {
            debug!(cancelled = cancelled, "Dropped pending expiry timers");
        }
    }

    /// Stops background expiry work. Pending timers are dropped without firing.
    ///
    /// The store stays usable; the next `set` with a ttl restarts the sweeper.
    /// Called automatically on drop.
    pub fn shutdown(&self) {
        self.stop_expiry();
    }

    /// The metrics log.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// The expiry deadline map.
    pub fn tracker(&self) -> &ExpiryTracker {
        &self.tracker
    }

    /// Storage engine statistics.
    pub fn storage_stats(&self) -> StorageStats {
        self.engine.stats()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.stop_expiry();
    }
}
