//! Bounded Task Scheduler
//!
//! The scheduler limits how many storage operations are in flight. Work is
//! submitted as a future plus a completion callback; at most `limit` of them
//! run at once and the rest wait in a FIFO queue.
//!
//! ## Dispatch
//!
//! ```text
//!  submit() ──> ┌──────────────┐  running < limit  ┌──────────────────┐
//!               │  FIFO queue  │──────────────────>│ running set (≤N) │
//!               └──────────────┘                   └────────┬─────────┘
//!                      ▲                                    │ future done
//!                      │                                    ▼
//!                      │                         on_complete(output)
//!                      │                         leave running set
//!                      └──────────── dispatch again ────────┘
//! ```
//!
//! Dispatch runs after every submit and after every completion. Tasks start
//! in submission order but may finish in any order when the limit is above
//! one. Nothing is preempted: a task that never finishes keeps its slot.
//!
//! ## Deferred Tasks
//!
//! Separately from the queue, the scheduler keeps at most one armed timer per
//! key. Each armed timer owns its action through a small state machine:
//!
//! ```text
//!   Armed ──timer elapsed──> Fired      (action runs)
//!   Armed ──cancel/Fire────> Fired      (action runs synchronously)
//!   Armed ──cancel/Suppress> Cancelled  (action dropped)
//! ```
//!
//! Whichever transition happens first takes the action; the other side finds
//! nothing left to do.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Identifier of a submitted task, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What cancelling an armed deferred task does with its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Drop the action without running it
    #[default]
    Suppress,
    /// Run the action immediately, before `cancel_deferred` returns
    Fire,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type Action = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    id: TaskId,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueuedTask>,
    running: HashSet<TaskId>,
    peak_running: usize,
    submitted: u64,
    completed: u64,
}

enum DeferredState {
    Armed(Action),
    Fired,
    Cancelled,
}

/// Moves an armed slot to `next` and hands back its action.
fn take_action(slot: &Mutex<DeferredState>, next: DeferredState) -> Option<Action> {
    let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match std::mem::replace(&mut *state, next) {
        DeferredState::Armed(action) => Some(action),
        previous => {
            *state = previous;
            None
        }
    }
}

struct Deferred {
    generation: u64,
    slot: Arc<Mutex<DeferredState>>,
    timer: AbortHandle,
}

struct Inner {
    limit: usize,
    cancel_policy: CancelPolicy,
    next_task_id: AtomicU64,
    next_generation: AtomicU64,
    state: Mutex<QueueState>,
    idle: Notify,
    deferred: Mutex<HashMap<String, Deferred>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deferred(&self) -> MutexGuard<'_, HashMap<String, Deferred>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts queued tasks until the queue is empty or the limit is reached.
    fn dispatch(self: &Arc<Self>, handle: &Handle) {
        let admitted: Vec<QueuedTask> = {
            let mut state = self.state();
            let mut admitted = Vec::new();
            while state.running.len() < self.limit {
                let Some(task) = state.queue.pop_front() else {
                    break;
                };
                state.running.insert(task.id);
                state.peak_running = state.peak_running.max(state.running.len());
                admitted.push(task);
            }
            admitted
        };

        // Spawn outside the lock: a spawn on a shut-down runtime drops the
        // task (and its slot guard) right away.
        for task in admitted {
            trace!(task_id = %task.id, "Dispatching task");
            let slot = RunningSlot {
                inner: Arc::clone(self),
                id: task.id,
                handle: handle.clone(),
            };
            handle.spawn(async move {
                let _slot = slot;
                task.job.await;
            });
        }
    }

    fn finish(self: &Arc<Self>, id: TaskId, handle: &Handle) {
        {
            let mut state = self.state();
            state.running.remove(&id);
            state.completed += 1;
        }
        trace!(task_id = %id, "Task completed");

        self.dispatch(handle);

        let idle = {
            let state = self.state();
            state.queue.is_empty() && state.running.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn forget_deferred(&self, key: &str, generation: u64) {
        let mut deferred = self.deferred();
        if deferred.get(key).is_some_and(|d| d.generation == generation) {
            deferred.remove(key);
        }
    }
}

/// Holds a running slot; frees it on drop, including when the task panics.
struct RunningSlot {
    inner: Arc<Inner>,
    id: TaskId,
    handle: Handle,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.inner.finish(self.id, &self.handle);
    }
}

/// Runs submitted futures with bounded concurrency and manages per-key timers.
///
/// Cloning is cheap; clones share the same queue and timers.
///
/// # Example
///
/// ```
/// use filekv::TaskScheduler;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let scheduler = TaskScheduler::new(2);
///
/// let rx = scheduler.submit_for_result(async { 40 + 2 });
/// assert_eq!(rx.await.unwrap(), 42);
///
/// scheduler.idle().await;
/// assert_eq!(scheduler.stats().completed, 1);
/// # }
/// ```
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("TaskScheduler")
            .field("limit", &self.inner.limit)
            .field("queued", &stats.queued)
            .field("running", &stats.running)
            .field("armed", &stats.armed)
            .finish()
    }
}

impl TaskScheduler {
    /// Creates a scheduler running at most `limit` tasks at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self::with_cancel_policy(limit, CancelPolicy::default())
    }

    /// Creates a scheduler with an explicit policy for cancelled deferred tasks.
    pub fn with_cancel_policy(limit: usize, cancel_policy: CancelPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: limit.max(1),
                cancel_policy,
                next_task_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
                deferred: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The concurrency limit.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// The policy applied by [`cancel_deferred`](Self::cancel_deferred).
    pub fn cancel_policy(&self) -> CancelPolicy {
        self.inner.cancel_policy
    }

    /// Queues `task`; `on_complete` receives its output once it finishes.
    ///
    /// Returns immediately. Must be called from within a tokio runtime. If the
    /// task panics its slot is freed but `on_complete` is never called.
    pub fn submit<F, C>(&self, task: F, on_complete: C) -> TaskId
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        C: FnOnce(F::Output) + Send + 'static,
    {
        let id = TaskId(self.inner.next_task_id.fetch_add(1, Ordering::Relaxed));
        let job: Job = Box::pin(async move {
            let output = task.await;
            on_complete(output);
        });

        {
            let mut state = self.inner.state();
            state.queue.push_back(QueuedTask { id, job });
            state.submitted += 1;
            trace!(task_id = %id, queued = state.queue.len(), "Task submitted");
        }

        self.inner.dispatch(&Handle::current());
        id
    }

    /// Queues `task` and returns a receiver for its output.
    ///
    /// The receiver errors if the task panicked.
    pub fn submit_for_result<F>(&self, task: F) -> oneshot::Receiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(task, move |output| {
            let _ = tx.send(output);
        });
        rx
    }

    /// Runs `action` once after `delay`, unless cancelled first.
    ///
    /// Any timer already armed for `key` is cancelled under the scheduler's
    /// [`CancelPolicy`] before the new one is armed, so a key never has more
    /// than one.
    pub fn schedule_deferred<A>(&self, key: impl Into<String>, delay: Duration, action: A)
    where
        A: FnOnce() + Send + 'static,
    {
        let key = key.into();
        self.cancel_deferred(&key);

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(DeferredState::Armed(Box::new(action))));

        let timer = {
            let inner = Arc::clone(&self.inner);
            let slot = Arc::clone(&slot);
            let key = key.clone();
            Handle::current().spawn(async move {
                tokio::time::sleep(delay).await;
                inner.forget_deferred(&key, generation);
                if let Some(action) = take_action(&slot, DeferredState::Fired) {
                    debug!(key = %key, "Deferred task fired");
                    action();
                }
            })
        };

        let displaced = self.inner.deferred().insert(
            key.clone(),
            Deferred {
                generation,
                slot,
                timer: timer.abort_handle(),
            },
        );
        debug!(key = %key, delay_ms = delay.as_millis(), "Deferred task armed");

        // Another caller armed the same key between our cancel and insert
        if let Some(displaced) = displaced {
            self.resolve_cancelled(&key, displaced, self.inner.cancel_policy);
        }
    }

    /// Cancels the timer armed for `key`, if any.
    ///
    /// Under [`CancelPolicy::Fire`] the pending action runs before this
    /// returns; under [`CancelPolicy::Suppress`] it is dropped.
    ///
    /// # Returns
    ///
    /// Returns `true` if an armed timer was found.
    pub fn cancel_deferred(&self, key: &str) -> bool {
        let Some(entry) = self.inner.deferred().remove(key) else {
            return false;
        };
        self.resolve_cancelled(key, entry, self.inner.cancel_policy);
        true
    }

    /// Cancels every armed timer without running any action.
    pub fn cancel_all_deferred(&self) -> usize {
        let entries: Vec<(String, Deferred)> = self.inner.deferred().drain().collect();
        let count = entries.len();
        for (key, entry) in entries {
            self.resolve_cancelled(&key, entry, CancelPolicy::Suppress);
        }
        count
    }

    fn resolve_cancelled(&self, key: &str, entry: Deferred, policy: CancelPolicy) {
        entry.timer.abort();
        let next = match policy {
            CancelPolicy::Suppress => DeferredState::Cancelled,
            CancelPolicy::Fire => DeferredState::Fired,
        };
        match (take_action(&entry.slot, next), policy) {
            (Some(action), CancelPolicy::Fire) => {
                debug!(key = %key, "Deferred task fired on cancel");
                action();
            }
            (Some(_), CancelPolicy::Suppress) => {
                debug!(key = %key, "Deferred task cancelled");
            }
            (None, _) => {}
        }
    }

    /// Returns `true` if a timer is armed for `key`.
    pub fn is_armed(&self, key: &str) -> bool {
        self.inner.deferred().contains_key(key)
    }

    /// Returns `true` when nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.queue.is_empty() && state.running.is_empty()
    }

    /// Waits until nothing is queued or running. Armed timers are not waited for.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Returns scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        let armed = self.inner.deferred().len();
        let state = self.inner.state();
        SchedulerStats {
            queued: state.queue.len(),
            running: state.running.len(),
            peak_running: state.peak_running,
            submitted: state.submitted,
            completed: state.completed,
            armed,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Tasks currently running
    pub running: usize,
    /// Highest number of tasks ever running at once
    pub peak_running: usize,
    /// Total tasks submitted
    pub submitted: u64,
    /// Total tasks that left the running set
    pub completed: u64,
    /// Deferred tasks currently armed
    pub armed: usize,
}
