//! tern-lsm: single-node log-structured merge engine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Db                                                        │
//! │  - WAL (tern-wal) + active skiplist (one SkiplistWriter)   │
//! │  - retired skiplist while a round is persisting it         │
//! └──────────────┬────────────────────────────────────────────┘
//!                │ Compactor (background task)
//!                ↓
//! ┌───────────────────────────────────────────────────────────┐
//! │  Levels (tern-sstable tables)                              │
//! │  L0[0] newest … L0[max_l0_levels-1]   one table per slot   │
//! │  L{max_l0_levels} …                   sorted, disjoint     │
//! └──────────────┬────────────────────────────────────────────┘
//!                │ every layout change is one manifest edit
//!                ↓
//! ┌───────────────────────────────────────────────────────────┐
//! │  Manifest: files, refcounted snapshots, live WAL number    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers pin the current snapshot for the lifetime of an iterator, so a
//! compaction never removes a table that is still being read.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tern_lsm::{Db, NoopMeter, Options};
//!
//! # async fn run() -> tern_lsm::Result<()> {
//! let db = Db::open(
//!     "/tmp/tern-db",
//!     Options::default(),
//!     tern_sstable::bytewise(),
//!     Arc::new(tern_core::DiskEnv),
//!     Arc::new(NoopMeter),
//! )
//! .await?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
mod compaction;
pub mod db;
pub mod error;
pub mod manifest;
pub mod merge;
pub mod options;
pub mod skiplist;
pub mod table_cache;

pub use batch::{BatchOp, WriteBatch};
pub use db::{Db, DbIterator};
pub use error::{Error, Result};
pub use manifest::{
    FileId, FileInfo, LiveFile, Manifest, NewFile, NewSnapshotRequest, SnapshotHandle, SnapshotId,
    SnapshotInfo,
};
pub use merge::{ConcatenationIterator, HeapIterator};
pub use options::Options;
pub use skiplist::{Skiplist, SkiplistIter, SkiplistWriter};
pub use table_cache::TableCache;
pub use tern_observe::{Meter, NoopMeter};
pub use tern_sstable::KvIterator;
