//! Key Expiry
//!
//! Keys written with a ttl are expired in up to two ways, chosen by
//! [`ExpiryMode`]:
//!
//! 1. **Scheduled**: the store arms a deferred removal on the
//!    [`TaskScheduler`](crate::TaskScheduler) for each `set` with a ttl.
//!    Removal happens close to the deadline whether or not anyone reads the key.
//! 2. **Tracked**: the store records `now + ttl` in an [`ExpiryTracker`].
//!    - **Passive**: `get` checks the deadline first and answers "absent" for an
//!      expired key without reading the file, queueing the removal behind it.
//!    - **Active**: an [`ExpirySweeper`] wakes up every `sweep_interval`,
//!      batch-removes every expired key and then drops their deadlines.
//!
//! ## Sweeper Lifecycle
//!
//! The sweeper is only running while there is something to expire. It is
//! started when the tracker goes from empty to non-empty and exits on its
//! own once it sees an empty tracker. Both checks happen under the tracker's
//! lock, so a `set` racing with the exit always gets a fresh sweeper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::scheduler::CancelPolicy;

/// Which expiry mechanisms are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryMode {
    /// Deferred removal per key on the scheduler
    Scheduled,
    /// Deadline map with passive check and active sweep
    Tracked,
    /// Both of the above
    #[default]
    Both,
}

impl ExpiryMode {
    pub fn uses_timers(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Both)
    }

    pub fn uses_tracker(&self) -> bool {
        matches!(self, Self::Tracked | Self::Both)
    }
}

/// Configuration for key expiry.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Which mechanisms run
    pub mode: ExpiryMode,

    /// Interval between active sweeps (default: 100ms)
    pub sweep_interval: Duration,

    /// What a newer `set` does to the removal armed by an older one
    pub cancel_policy: CancelPolicy,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            mode: ExpiryMode::default(),
            sweep_interval: Duration::from_millis(100),
            cancel_policy: CancelPolicy::Suppress,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    deadlines: HashMap<String, Instant>,
    sweeper_armed: bool,
}

/// Deadline map for tracked expiry.
///
/// A key with no entry never expires.
#[derive(Debug, Default)]
pub struct ExpiryTracker {
    state: Mutex<TrackerState>,
    sweeping: AtomicBool,
}

impl ExpiryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the deadline for `key`, or clears it when `ttl` is `None`.
    ///
    /// # Returns
    ///
    /// Returns `true` when the caller must start a sweeper (the tracker
    /// just became non-empty and no sweeper is armed).
    pub fn record(&self, key: &str, ttl: Option<Duration>) -> bool {
        let mut state = self.state();

        let deadline = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        match deadline {
            Some(deadline) => {
                state.deadlines.insert(key.to_string(), deadline);
                if state.sweeper_armed {
                    false
                } else {
                    state.sweeper_armed = true;
                    true
                }
            }
            None => {
                state.deadlines.remove(key);
                false
            }
        }
    }

    /// The recorded deadline for `key`.
    pub fn deadline(&self, key: &str) -> Option<Instant> {
        self.state().deadlines.get(key).copied()
    }

    /// Checks if `key` has a deadline that has passed.
    pub fn is_expired(&self, key: &str) -> bool {
        self.deadline(key)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Every key whose deadline is at or before `now`.
    pub fn expired_keys(&self, now: Instant) -> Vec<String> {
        self.state()
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops the deadlines of `keys` that are still expired at `now`.
    ///
    /// A key that was `set` again in the meantime has a later (or no)
    /// deadline and is left alone.
    pub fn forget_expired<S: AsRef<str>>(&self, keys: &[S], now: Instant) -> usize {
        let mut state = self.state();
        let mut forgotten = 0;
        for key in keys {
            let key = key.as_ref();
            if state.deadlines.get(key).is_some_and(|d| *d <= now) {
                state.deadlines.remove(key);
                forgotten += 1;
            }
        }
        forgotten
    }

    /// Marks the sweeper as gone if there is nothing left to track.
    pub fn disarm_if_empty(&self) -> bool {
        let mut state = self.state();
        if state.deadlines.is_empty() {
            state.sweeper_armed = false;
            true
        } else {
            false
        }
    }

    /// Marks the sweeper as gone unconditionally (shutdown).
    pub fn disarm(&self) {
        self.state().sweeper_armed = false;
    }

    /// Drops every deadline.
    pub fn clear(&self) {
        self.state().deadlines.clear();
    }

    pub fn is_sweeper_armed(&self) -> bool {
        self.state().sweeper_armed
    }

    pub fn len(&self) -> usize {
        self.state().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the sweep flag; `None` if a sweep is already running.
    fn try_begin_sweep(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard { flag: &self.sweeping })
    }
}

struct SweepGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Removes a batch of keys from storage for the sweeper.
pub trait Evictor: Send + Sync + 'static {
    /// Removes those of `keys` that are still expired once storage is locked;
    /// resolves to `true` on success.
    fn evict(&self, keys: Vec<String>) -> impl Future<Output = bool> + Send;
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was in progress
    Busy,
    /// Nothing had expired
    Clean,
    /// Expired keys were removed and forgotten
    Evicted(usize),
    /// Storage removal failed; deadlines kept for the next sweep
    Failed,
}

/// Runs a single sweep: remove every expired key, then forget their deadlines.
///
/// Overlapping calls are refused with [`SweepOutcome::Busy`].
pub async fn sweep_once<E: Evictor>(tracker: &ExpiryTracker, evictor: &E) -> SweepOutcome {
    let Some(_guard) = tracker.try_begin_sweep() else {
        trace!("Sweep already in progress, skipping");
        return SweepOutcome::Busy;
    };

    let keys = tracker.expired_keys(Instant::now());
    if keys.is_empty() {
        return SweepOutcome::Clean;
    }

    if evictor.evict(keys.clone()).await {
        let forgotten = tracker.forget_expired(&keys, Instant::now());
        SweepOutcome::Evicted(forgotten)
    } else {
        warn!(keys = keys.len(), "Failed to remove expired keys, will retry");
        SweepOutcome::Failed
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// # Arguments
    ///
    /// * `tracker` - The deadlines to sweep
    /// * `evictor` - Removes expired keys from storage
    /// * `interval` - Time between sweeps
    ///
    /// # Returns
    ///
    /// Returns a handle that can be used to stop the sweeper.
    /// The sweeper also stops by itself once the tracker is empty.
    pub fn start<E: Evictor>(tracker: Arc<ExpiryTracker>, evictor: E, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(tracker, evictor, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis(), "Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Returns `true` once the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.shutdown_tx.is_closed()
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop<E: Evictor>(
    tracker: Arc<ExpiryTracker>,
    evictor: E,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        // Wait for the interval or shutdown signal
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        match sweep_once(&tracker, &evictor).await {
            SweepOutcome::Evicted(count) => {
                debug!(
                    expired = count,
                    keys_remaining = tracker.len(),
                    "Expired keys cleaned up"
                );
            }
            SweepOutcome::Busy | SweepOutcome::Clean | SweepOutcome::Failed => {}
        }

        if tracker.disarm_if_empty() {
            info!("No keys left to expire, sweeper going idle");
            return;
        }
    }
}

/// Per-key write epochs.
///
/// Every `set` takes a new epoch for its key before anything else. A pending
/// removal that remembers the epoch it was created for can then tell whether
/// the key has been written since, and only the holder of the latest epoch
/// may arm an expiry timer when its write finishes.
#[derive(Debug, Default)]
pub struct WriteEpochs {
    next: AtomicU64,
    latest: Mutex<HashMap<String, u64>>,
}

impl WriteEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a write to `key` and returns its epoch.
    pub fn begin(&self, key: &str) -> u64 {
        let epoch = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.latest().insert(key.to_string(), epoch);
        epoch
    }

    /// The epoch of the most recent write to `key`.
    pub fn current(&self, key: &str) -> Option<u64> {
        self.latest().get(key).copied()
    }

    /// Checks if no write to `key` has begun since `epoch`.
    pub fn is_latest(&self, key: &str, epoch: u64) -> bool {
        self.current(key) == Some(epoch)
    }

    /// Runs `f` if `epoch` is still the latest for `key`.
    ///
    /// `f` runs with the epoch table locked, so a concurrent [`begin`](Self::begin)
    /// on any key waits until it returns.
    pub fn run_if_latest<F: FnOnce()>(&self, key: &str, epoch: u64, f: F) -> bool {
        let latest = self.latest();
        if latest.get(key) == Some(&epoch) {
            f();
            drop(latest);
            true
        } else {
            false
        }
    }

    /// Forgets every key.
    pub fn clear(&self) {
        self.latest().clear();
    }
}
