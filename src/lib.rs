//! # filekv - A Flat-File Key-Value Store
//!
//! filekv keeps integer values under string keys in a single line-oriented
//! text file (`key:value` per line). Every operation goes through a bounded
//! task scheduler and serializes on the file, so any number of callers can
//! hammer the store without ever interleaving two read-modify-write cycles.
//!
//! ## Features
//!
//! - **Plain-text storage**: the data file is the only state; no cache
//! - **Bounded concurrency**: at most N storage operations run at once, the rest queue FIFO
//! - **TTL Support**: keys can expire through per-key timers, a deadline map, or both
//! - **Isolated execution**: storage calls may run on tokio's blocking pool instead of inline
//! - **Metrics**: every `get` / `set` leaves a timed record
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                 Store                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐     │
//! │  │   Metrics   │<───│  get / set  │───>│      ExpiryTracker       │     │
//! │  │  (records)  │    │             │    │  (deadlines, passive)    │     │
//! │  └─────────────┘    └──────┬──────┘    └────────────┬─────────────┘     │
//! │                            │                        │                   │
//! │                            ▼                        ▼                   │
//! │  ┌──────────────────────────────────────┐   ┌──────────────────┐        │
//! │  │           TaskScheduler              │<──│  ExpirySweeper   │        │
//! │  │  FIFO queue, ≤ N running,            │   │ (Background Task)│        │
//! │  │  per-key deferred removals           │   └──────────────────┘        │
//! │  └──────────────────┬───────────────────┘                               │
//! │                     ▼                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Executor   │───>│StorageEngine│───>│  FileLock   │───> db.txt       │
//! │  │inline/isol. │    │ line codec  │    │mutex+marker │                  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use filekv::{Store, StoreConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), filekv::StoreError> {
//! # let dir = std::env::temp_dir().join("filekv-doc-lib");
//! # std::fs::create_dir_all(&dir).unwrap();
//! let store = Store::new(StoreConfig::new(dir.join("db.txt")))?;
//! store.init().await?;
//!
//! store.set("a", 99993).await?;
//! store.set_with_ttl("b", 1, Some(Duration::from_millis(50))).await?;
//!
//! assert_eq!(store.get("a").await?, Some(99993));
//! println!("{}", store.metrics().summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: file lock, line codec and the storage engine
//! - [`scheduler`]: bounded task scheduler with per-key deferred tasks
//! - [`executor`]: inline or isolated execution of storage calls
//! - [`expiry`]: deadline tracking and the background sweeper
//! - [`metrics`]: per-operation timing records
//! - [`store`]: the `get` / `set` facade tying it all together
//!
//! ## Failure Model
//!
//! Storage failures never surface as errors from `get` / `set`: a failed write
//! returns `false`, a failed read returns `None`, and the metrics record
//! carries the reason. `Err` is reserved for API misuse such as calling the
//! store before [`Store::init`] or passing a key containing `:`.

pub mod config;
pub mod error;
pub mod executor;
pub mod expiry;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod store;

// Re-export commonly used types for convenience
pub use config::{StoreConfig, DEFAULT_DATA_FILE};
pub use error::{ConfigError, StorageError, StoreError};
pub use executor::Executor;
pub use expiry::{ExpiryConfig, ExpiryMode, ExpirySweeper, ExpiryTracker};
pub use metrics::{MetricRecord, Metrics, MetricsSummary, OperationKind};
pub use scheduler::{CancelPolicy, SchedulerStats, TaskId, TaskScheduler};
pub use storage::{LockConfig, Record, StorageEngine, StorageStats};
pub use store::Store;

/// Version of filekv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
