//! Operation Metrics
//!
//! Every `get` and `set` on the store opens a [`MetricRecord`] with
//! [`Metrics::begin`] and closes it with [`Metrics::end`] when the operation's
//! completion runs. The log is append-only and ids come from a counter owned
//! by the collector, so independent stores never share a sequence.
//!
//! Formatting the log is left to the caller; [`Metrics::summary`] gives the
//! usual aggregates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Kind of store operation being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Get,
    Set,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a metric record.
pub type MetricId = u64;

/// One measured operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub id: MetricId,
    pub kind: OperationKind,
    /// Wall-clock time the operation was submitted
    pub start_time: SystemTime,
    /// Time until completion; `None` while the operation is still pending
    pub elapsed: Option<Duration>,
    pub success: bool,
    pub message: String,
}

impl MetricRecord {
    pub fn is_complete(&self) -> bool {
        self.elapsed.is_some()
    }
}

struct Entry {
    record: MetricRecord,
    started: Instant,
}

/// Append-only metrics log.
#[derive(Default)]
pub struct Metrics {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<MetricId, Entry>>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("records", &self.entries().len())
            .finish()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<MetricId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a record for an operation starting now.
    pub fn begin(&self, kind: OperationKind) -> MetricId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Entry {
            record: MetricRecord {
                id,
                kind,
                start_time: SystemTime::now(),
                elapsed: None,
                success: false,
                message: String::new(),
            },
            started: Instant::now(),
        };
        self.entries().insert(id, entry);
        id
    }

    /// Closes record `id`. Unknown ids and already closed records are ignored.
    pub fn end(&self, id: MetricId, success: bool, message: impl Into<String>) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(&id) {
            if entry.record.elapsed.is_none() {
                entry.record.elapsed = Some(entry.started.elapsed());
                entry.record.success = success;
                entry.record.message = message.into();
            }
        }
    }

    /// A copy of the log, ordered by id.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.entries().values().map(|e| e.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates per operation kind.
    pub fn summary(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();
        for entry in self.entries().values() {
            let record = &entry.record;
            let stats = match record.kind {
                OperationKind::Get => &mut summary.get,
                OperationKind::Set => &mut summary.set,
            };
            stats.add(record);
        }
        summary
    }
}

/// Aggregated metrics for one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindSummary {
    pub total: u64,
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_elapsed: Duration,
    pub max_elapsed: Duration,
}

impl KindSummary {
    fn add(&mut self, record: &MetricRecord) {
        self.total += 1;
        match record.elapsed {
            None => self.pending += 1,
            Some(elapsed) => {
                if record.success {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
                self.total_elapsed += elapsed;
                self.max_elapsed = self.max_elapsed.max(elapsed);
            }
        }
    }

    /// Mean time of completed operations.
    pub fn mean_elapsed(&self) -> Duration {
        let completed = self.succeeded + self.failed;
        if completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_elapsed.as_secs_f64() / completed as f64)
    }
}

/// Aggregated metrics for the whole log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub get: KindSummary,
    pub set: KindSummary,
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, stats) in [("get", &self.get), ("set", &self.set)] {
            writeln!(
                f,
                "{kind}: total={} ok={} failed={} pending={} mean={:?} max={:?}",
                stats.total,
                stats.succeeded,
                stats.failed,
                stats.pending,
                stats.mean_elapsed(),
                stats.max_elapsed,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase_per_collector() {
        let a = Metrics::new();
        let b = Metrics::new();

        assert_eq!(a.begin(OperationKind::Get), 1);
        assert_eq!(a.begin(OperationKind::Set), 2);
        // Independent collectors have independent sequences
        assert_eq!(b.begin(OperationKind::Get), 1);
    }

    #[test]
    fn test_begin_then_end() {
        let metrics = Metrics::new();
        let id = metrics.begin(OperationKind::Set);

        let pending = &metrics.records()[0];
        assert!(!pending.is_complete());
        assert!(!pending.success);

        std::thread::sleep(Duration::from_millis(2));
        metrics.end(id, true, "");

        let done = &metrics.records()[0];
        assert!(done.is_complete());
        assert!(done.success);
        assert!(done.elapsed.unwrap() >= Duration::from_millis(2));
        assert_eq!(done.kind, OperationKind::Set);
    }

    #[test]
    fn test_end_is_applied_once() {
        let metrics = Metrics::new();
        let id = metrics.begin(OperationKind::Get);

        metrics.end(id, false, "disk full");
        metrics.end(id, true, "late");

        let record = &metrics.records()[0];
        assert!(!record.success);
        assert_eq!(record.message, "disk full");
    }

    #[test]
    fn test_end_unknown_id_is_ignored() {
        let metrics = Metrics::new();
        metrics.end(42, true, "");
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_records_ordered_by_id() {
        let metrics = Metrics::new();
        for _ in 0..5 {
            metrics.begin(OperationKind::Get);
        }
        let ids: Vec<_> = metrics.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_summary() {
        let metrics = Metrics::new();
        let a = metrics.begin(OperationKind::Get);
        let b = metrics.begin(OperationKind::Get);
        let c = metrics.begin(OperationKind::Set);
        metrics.begin(OperationKind::Set);

        metrics.end(a, true, "");
        metrics.end(b, false, "io");
        metrics.end(c, true, "");

        let summary = metrics.summary();
        assert_eq!(summary.get.total, 2);
        assert_eq!(summary.get.succeeded, 1);
        assert_eq!(summary.get.failed, 1);
        assert_eq!(summary.set.total, 2);
        assert_eq!(summary.set.pending, 1);

        let text = summary.to_string();
        assert!(text.contains("get: total=2"));
        assert!(text.contains("set: total=2"));
    }

    #[test]
    fn test_mean_elapsed_beyond_u32_count() {
        let stats = KindSummary {
            succeeded: 5_000_000_000,
            total_elapsed: Duration::from_secs(5_000_000_000),
            ..Default::default()
        };
        assert_eq!(stats.mean_elapsed(), Duration::from_secs(1));
        assert_eq!(KindSummary::default().mean_elapsed(), Duration::ZERO);
    }
}
