//! # Strata
//!
//! An embedded LSM-tree key-value storage engine: ordered byte keys,
//! atomic write batches, point-in-time snapshots and background
//! compaction, all inside one process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::Database;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Creates the directory on first use
//!     let db = Database::open("./my_database")?;
//!
//!     db.put(b"user:1:name", b"Alice")?;
//!     db.put(b"user:1:email", b"alice@example.com")?;
//!
//!     if let Some(name) = db.get(b"user:1:name")? {
//!         println!("Name: {}", String::from_utf8_lossy(&name));
//!     }
//!
//!     db.delete(b"user:1:email")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Batches and snapshots
//!
//! ```rust,no_run
//! use strata::Database;
//!
//! let db = Database::open("./data")?;
//! let snapshot = db.snapshot();
//!
//! let mut batch = db.batch();
//! batch.put(b"a", b"1").delete(b"b");
//! db.write(batch)?;
//!
//! // The snapshot still sees the state before the batch
//! assert_eq!(db.get_at(b"a", &snapshot)?, None);
//! # Ok::<(), strata::Error>(())
//! ```
//!
//! ## Lower-level API
//!
//! [`Db`] exposes every engine knob: [`Options`] at open, [`ReadOptions`]
//! and [`WriteOptions`] per call, bidirectional [`DbIterator`]s, manual
//! compaction, properties and size estimates. [`Database`] wraps it with
//! defaults and owned results.

use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod logging;

pub use strata_core::{
    BytewiseComparator, CompactionConfig, Comparator, CompressionType, Error, Options, Result,
    NUM_LEVELS,
};
pub use strata_snapshot::Snapshot;
pub use strata_storage::{destroy, BatchOp, Db, DbIterator, ReadOptions, WriteBatch, WriteOptions};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A shareable database handle with default options.
///
/// Clones share one engine. The engine shuts down when the last clone is
/// closed or dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use strata::Database;
///
/// let db = Database::open("./my_data")?;
/// db.put(b"key", b"value")?;
///
/// // Data persists across restarts
/// db.close()?;
/// let db = Database::open("./my_data")?;
/// assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
/// # Ok::<(), strata::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<Db>,
}

impl Database {
    /// Opens the database at `path`, creating it if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, Options::default().with_create_if_missing(true))
    }

    /// Opens the database at `path` with explicit engine options.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening Strata database");
        let db = Db::open(path, options)?;
        Ok(Database {
            inner: Arc::new(db),
        })
    }

    /// Returns the underlying engine handle.
    pub fn engine(&self) -> &Db {
        &self.inner
    }

    /// Reads the newest value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key, &ReadOptions::default())
    }

    /// Reads `key` as of `snapshot`.
    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>> {
        let options = ReadOptions::new().with_snapshot(snapshot.clone());
        self.inner.get(key, &options)
    }

    /// Inserts or overwrites `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value, WriteOptions::default())?;
        Ok(())
    }

    /// Removes `key`. Deleting a missing key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key, WriteOptions::default())?;
        Ok(())
    }

    /// Returns an empty batch for [`Database::write`].
    pub fn batch(&self) -> WriteBatch {
        self.inner.new_write_batch()
    }

    /// Applies `batch` atomically.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.inner.write(batch, WriteOptions::default())?;
        Ok(())
    }

    /// Applies `batch` atomically and waits for the log to reach disk.
    pub fn write_sync(&self, batch: WriteBatch) -> Result<()> {
        self.inner.write(batch, WriteOptions::new().with_sync(true))?;
        Ok(())
    }

    /// Pins the current state for later reads.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.get_snapshot()
    }

    /// Iterates every live entry in key order.
    pub fn iter(&self) -> Iter {
        let mut it = self.inner.new_iterator(&ReadOptions::default());
        it.seek_to_first();
        Iter { it, failed: false }
    }

    /// Iterates live entries with keys at or after `start`.
    pub fn iter_from(&self, start: &[u8]) -> Iter {
        let mut it = self.inner.new_iterator(&ReadOptions::default());
        it.seek(start);
        Iter { it, failed: false }
    }

    /// Iterates the entries visible at `snapshot`.
    pub fn iter_at(&self, snapshot: &Snapshot) -> Iter {
        let options = ReadOptions::new().with_snapshot(snapshot.clone());
        let mut it = self.inner.new_iterator(&options);
        it.seek_to_first();
        Iter { it, failed: false }
    }

    /// Compacts the whole key space.
    pub fn compact(&self) -> Result<()> {
        self.inner.compact_range(None, None)
    }

    /// Looks up an engine property such as `strata.stats`.
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.get_property(name)
    }

    /// Closes this handle. The engine shuts down once no clone remains.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(db) => db.close(),
            Err(_) => Ok(()),
        }
    }
}

/// Owned iterator over `(key, value)` pairs returned by [`Database::iter`].
///
/// A read error is yielded once, after which the iterator is exhausted.
#[derive(Debug)]
pub struct Iter {
    it: DbIterator,
    failed: bool,
}

impl Iterator for Iter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.it.valid() {
            return match self.it.status() {
                Ok(()) => None,
                Err(e) => {
                    self.failed = true;
                    Some(Err(e))
                }
            };
        }
        let entry = (self.it.key().to_vec(), self.it.value().to_vec());
        self.it.next();
        Some(Ok(entry))
    }
}
