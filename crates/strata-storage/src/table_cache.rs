//! Table cache - bounded set of open table files keyed by file number.
//!
//! Opening a table reads and checks its footer and index, so readers share
//! open tables through this cache. Tables are closed once the cache is over
//! capacity; a table still referenced by an iterator stays open until that
//! iterator is dropped.

use crate::filename::table_file_name;
use crate::iterator::{EmptyIterator, InternalIterator};
use crate::key::InternalKeyComparator;
use crate::sstable::SSTableReader;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{Error, Result};
use tracing::{debug, warn};

type OpenTables = moka::sync::Cache<u64, Arc<SSTableReader>>;

/// Bounded cache of open tables
pub struct TableCache {
    dbname: PathBuf,
    cmp: InternalKeyComparator,
    tables: OpenTables,
}

impl TableCache {
    /// Cache for tables under `dbname`, keeping at most `capacity` open
    pub fn new(dbname: impl Into<PathBuf>, cmp: InternalKeyComparator, capacity: usize) -> Self {
        Self {
            dbname: dbname.into(),
            cmp,
            tables: OpenTables::builder().max_capacity(capacity.max(1) as u64).build(),
        }
    }

    /// The open table for file `number`, opening it on a miss.
    ///
    /// Concurrent misses on one file share a single open.
    pub fn find_table(&self, number: u64) -> Result<Arc<SSTableReader>> {
        self.tables
            .try_get_with(number, || {
                let path = table_file_name(&self.dbname, number);
                let table = SSTableReader::open(&path, self.cmp.clone()).map_err(|e| {
                    warn!(file = number, error = %e, "Failed to open table");
                    e
                })?;
                debug!(file = number, "Opened table");
                Ok::<_, Error>(Arc::new(table))
            })
            .map_err(|e: Arc<Error>| (*e).clone())
    }

    /// Cursor over file `number`; an open failure yields an iterator that
    /// reports the error from `status()`.
    pub fn get_iterator(&self, number: u64, verify_checksums: bool) -> Box<dyn InternalIterator> {
        match self.find_table(number) {
            Ok(table) => Box::new(table.iter(verify_checksums)),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// First entry of file `number` with internal key >= `target`
    pub fn get(
        &self,
        number: u64,
        target: &[u8],
        verify_checksums: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.find_table(number)?.get(target, verify_checksums)
    }

    /// Approximate offset of `key` within file `number`; 0 if it cannot be opened
    pub fn approximate_offset_of(&self, number: u64, key: &[u8]) -> u64 {
        match self.find_table(number) {
            Ok(table) => table.approximate_offset_of(key),
            Err(_) => 0,
        }
    }

    /// Drop the cached handle for a deleted file
    pub fn evict(&self, number: u64) {
        self.tables.invalidate(&number);
    }

    /// Number of open tables held
    pub fn len(&self) -> usize {
        self.tables.run_pending_tasks();
        self.tables.entry_count() as usize
    }

    /// True if no table is held open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
