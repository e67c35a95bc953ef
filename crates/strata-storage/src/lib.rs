//! # Strata Storage Engine
//!
//! LSM-tree storage engine for Strata.
//!
//! ## Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Strata.**
//!
//! Users should depend on the main `strata` crate instead, which provides
//! the stable public API. This crate's API may change without notice
//! between minor versions.
//!
//! ---
//!
//! The engine is built from:
//!
//! - **Log**: every write batch is appended to a write-ahead log before it
//!   becomes visible ([`strata_wal`])
//! - **Memtable**: a concurrent skip list of recent writes ([`memtable`])
//! - **Sorted tables**: immutable on-disk files of internal keys
//!   ([`sstable`], opened through the [`table_cache`])
//! - **Versions**: the set of live tables per level, changed only by
//!   appending [`version_edit`]s to the manifest ([`version_set`])
//! - **Compaction**: background merging of tables into deeper levels
//!   ([`compaction`], driven by [`db`])
//!
//! ## Architecture
//!
//! ```text
//! write → log → memtable ─(full)→ immutable memtable ─(flush)→ level 0
//!                                                               ↓
//!                                         compaction → level 1 … level 6
//! ```

pub mod batch;
pub mod compaction;
pub mod db;
pub mod filename;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod options;
pub mod sstable;
pub mod table_cache;
pub mod version;
pub mod version_edit;
pub mod version_set;

pub use batch::{BatchOp, WriteBatch};
pub use db::{destroy, Db, DbIterator};
pub use options::{ReadOptions, WriteOptions};
pub use strata_snapshot::Snapshot;
