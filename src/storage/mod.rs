//! Storage Module
//!
//! This module owns the data file. Nothing else in filekv reads or writes it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │        get / set / remove / remove_many / records           │
//! └───────────────┬───────────────────────────┬─────────────────┘
//!                 │                           │
//!                 ▼                           ▼
//!    ┌────────────────────────┐   ┌────────────────────────┐
//!    │       FileLock         │   │        codec           │
//!    │ path mutex + "-lock"   │   │ "key:value" lines      │
//!    │ marker file            │   │ find / upsert / remove │
//!    └────────────────────────┘   └────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use filekv::storage::{LockConfig, StorageEngine};
//!
//! let dir = std::env::temp_dir().join("filekv-doc-storage");
//! std::fs::create_dir_all(&dir).unwrap();
//! let engine = StorageEngine::new(dir.join("db.txt"), LockConfig::default());
//! engine.reset().unwrap();
//!
//! engine.set("a", 1).unwrap();
//! engine.set("b", 2).unwrap();
//! assert_eq!(engine.remove_many(&["a", "missing"]).unwrap(), 1);
//! assert_eq!(engine.get("b").unwrap(), Some(2));
//! ```

pub mod codec;
pub mod engine;
pub mod lock;

// Re-export commonly used types
pub use codec::Record;
pub use engine::{StorageEngine, StorageStats};
pub use lock::{marker_path, FileLock, LockConfig, LOCK_SUFFIX};
