//! The engine.
//!
//! A [`Db`] owns one database directory. Foreground threads call it
//! concurrently; one background thread flushes frozen memtables and runs
//! compactions. All shared metadata (memtable pointers, the version set,
//! the snapshot list, the writer queue and the background flags) lives in
//! [`DbState`] behind a single mutex, which is never held across disk I/O:
//!
//! ```text
//! write ──► writer queue ──► leader: log append + memtable insert (unlocked)
//!                                │
//!                        memtable full? ──► freeze, new log, wake background
//!                                                   │
//! background thread ◄───────────────────────────────┘
//!   flush imm ──► level-0 table ──► manifest (unlocked write) ──► new version
//!   compaction ──► merge inputs (unlocked) ──► manifest ──► new version
//! ```

mod background;
mod iter;
mod recovery;
mod write;

pub use iter::DbIterator;

use crate::batch::WriteBatch;
use crate::compaction::CompactionStats;
use crate::filename::{lock_file_name, log_file_name, parse_file_name, FileType};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{
    InternalKey, InternalKeyComparator, LookupKey, LookupResult, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::memtable::MemTable;
use crate::options::{ReadOptions, WriteOptions};
use crate::table_cache::TableCache;
use crate::version_edit::VersionEdit;
use crate::version_set::VersionSet;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use strata_core::{Error, Options, Result, MAX_SEQUENCE_NUMBER, NUM_LEVELS};
use strata_snapshot::{Snapshot, SnapshotList};
use strata_wal::LogWriter;
use tracing::{debug, error, info, warn};
use write::Writer;

/// A manual compaction request, advanced one chunk at a time by the
/// background thread
struct ManualCompaction {
    id: u64,
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// Engine metadata guarded by the engine mutex
struct DbState {
    mem: Arc<MemTable>,
    /// Frozen memtable waiting to be flushed
    imm: Option<Arc<MemTable>>,
    versions: VersionSet,
    snapshots: SnapshotList,
    writers: VecDeque<Arc<Writer>>,
    logfile_number: u64,
    /// First background failure; sticky until reopen
    bg_error: Option<Error>,
    bg_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
    next_manual_id: u64,
    /// Table numbers being written that no version references yet
    pending_outputs: HashSet<u64>,
    /// Per output level
    stats: [CompactionStats; NUM_LEVELS],
}

/// State shared between the handle, the background thread and iterators
struct DbInner {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    state: Mutex<DbState>,
    /// Signalled whenever background work is scheduled or finishes
    bg_cv: Condvar,
    shutting_down: AtomicBool,
    /// Mirrors `state.imm.is_some()` for the compaction loop
    has_imm: AtomicBool,
    /// Only the current write leader appends; a memtable switch replaces it
    log: Mutex<Option<LogWriter>>,
}

impl DbInner {
    fn new(dbname: PathBuf, options: Arc<Options>) -> Self {
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            icmp.clone(),
            options.table_cache_capacity(),
        ));
        let versions = VersionSet::new(
            dbname.clone(),
            Arc::clone(&options),
            Arc::clone(&table_cache),
            icmp.clone(),
        );
        let state = DbState {
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            versions,
            snapshots: SnapshotList::new(),
            writers: VecDeque::new(),
            logfile_number: 0,
            bg_error: None,
            bg_compaction_scheduled: false,
            manual_compaction: None,
            next_manual_id: 0,
            pending_outputs: HashSet::new(),
            stats: [CompactionStats::default(); NUM_LEVELS],
        };
        Self {
            dbname,
            options,
            icmp,
            table_cache,
            state: Mutex::new(state),
            bg_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            log: Mutex::new(None),
        }
    }

    fn verify_checksums(&self, options: &ReadOptions) -> bool {
        options.verify_checksums || self.options.paranoid_checks
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Remember the first background failure and wake everyone waiting on it
    fn record_background_error(&self, state: &mut DbState, e: Error) {
        if state.bg_error.is_none() {
            error!(error = %e, "Background error; writes will fail until reopen");
            state.bg_error = Some(e);
            self.bg_cv.notify_all();
        }
    }

    fn background_error(state: &DbState) -> Result<()> {
        match &state.bg_error {
            Some(e) => Err(Error::Background(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Exclusive advisory lock on a database directory
struct DbLock {
    file: File,
    path: PathBuf,
}

impl DbLock {
    fn acquire(dbname: &Path) -> Result<Self> {
        let path = lock_file_name(dbname);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired database lock");
                Ok(Self { file, path })
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Database is locked");
                Err(Error::Io(Arc::new(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("lock {}: already held by another process", path.display()),
                ))))
            }
        }
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release database lock");
        }
    }
}

/// An open database.
///
/// All methods take `&self`; share the handle between threads with an
/// `Arc`. Dropping the handle closes the database.
pub struct Db {
    inner: Arc<DbInner>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
    lock: Mutex<Option<DbLock>>,
}

impl Db {
    /// Open the database in `path`.
    ///
    /// Fails with `InvalidArgument` if the database is missing and
    /// `create_if_missing` is off, if it exists and `error_if_exists` is
    /// on, or if it was created with a comparator of another name.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let dbname = path.as_ref().to_path_buf();
        if !dbname.exists() {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    dbname.display()
                )));
            }
            fs::create_dir_all(&dbname)?;
        }
        let lock = DbLock::acquire(&dbname)?;

        let inner = Arc::new(DbInner::new(dbname, Arc::new(options)));
        {
            let mut state = inner.state.lock();
            let mut edit = VersionEdit::default();
            let mut save_manifest = inner.recover(&mut state, &mut edit)?;

            if inner.log.lock().is_none() {
                let number = state.versions.new_file_number();
                let writer = LogWriter::create(&log_file_name(&inner.dbname, number))?;
                *inner.log.lock() = Some(writer);
                state.logfile_number = number;
                save_manifest = true;
            }
            if save_manifest {
                edit.set_prev_log_number(0);
                edit.set_log_number(state.logfile_number);
                state.versions.log_and_apply(&mut edit)?;
            }
            inner.remove_obsolete_files(&mut state);
            info!(
                path = %inner.dbname.display(),
                log = state.logfile_number,
                last_sequence = state.versions.last_sequence(),
                summary = %state.versions.level_summary(),
                "Opened database"
            );
        }

        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("strata-compaction".to_string())
            .spawn(move || background::background_thread(worker))?;

        {
            let mut state = inner.state.lock();
            inner.maybe_schedule_compaction(&mut state);
        }

        Ok(Self {
            inner,
            bg_thread: Mutex::new(Some(handle)),
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Directory of this database
    pub fn path(&self) -> &Path {
        &self.inner.dbname
    }

    /// The value of `key`, or `None` if it is absent or deleted.
    pub fn get(&self, key: &[u8], options: &ReadOptions) -> Result<Option<Vec<u8>>> {
        let (mem, imm, current, sequence) = {
            let state = self.inner.state.lock();
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                sequence,
            )
        };

        let lookup = LookupKey::new(key, sequence);
        let mut found = mem.get(&lookup);
        if found.is_none() {
            if let Some(imm) = &imm {
                found = imm.get(&lookup);
            }
        }
        if found.is_none() {
            let (result, stats) = current.get(self.inner.verify_checksums(options), &lookup)?;
            found = result;
            if current.update_stats(stats) {
                let mut state = self.inner.state.lock();
                self.inner.maybe_schedule_compaction(&mut state);
            }
        }

        Ok(match found {
            Some(LookupResult::Value(value)) => Some(value),
            Some(LookupResult::Deleted) | None => None,
        })
    }

    /// Set `key` to `value`
    pub fn put(&self, key: &[u8], value: &[u8], options: WriteOptions) -> Result<Option<Snapshot>> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, options)
    }

    /// Remove `key`; removing an absent key is not an error
    pub fn delete(&self, key: &[u8], options: WriteOptions) -> Result<Option<Snapshot>> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, options)
    }

    /// Apply every operation of `batch` atomically.
    ///
    /// With `options.snapshot`, returns a snapshot that sees this batch
    /// and every write ordered before it.
    pub fn write(&self, batch: WriteBatch, options: WriteOptions) -> Result<Option<Snapshot>> {
        self.inner.write(Some(batch), options)
    }

    /// An empty batch for [`Db::write`]
    pub fn new_write_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    /// A cursor over the user keys visible at the read snapshot (or now).
    pub fn new_iterator(&self, options: &ReadOptions) -> DbIterator {
        let (children, current, sequence) = {
            let state = self.inner.state.lock();
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            let mut children: Vec<Box<dyn InternalIterator>> = vec![Box::new(state.mem.iter())];
            if let Some(imm) = &state.imm {
                children.push(Box::new(imm.iter()));
            }
            let current = state.versions.current();
            current.add_iterators(self.inner.verify_checksums(options), &mut children);
            (children, current, sequence)
        };
        let merged = MergingIterator::new(self.inner.icmp.clone(), children);
        DbIterator::new(Arc::clone(&self.inner), Box::new(merged), sequence, current)
    }

    /// A snapshot of the current state; dropping every clone releases it
    pub fn get_snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let sequence = state.versions.last_sequence();
        state.snapshots.acquire(sequence)
    }

    /// Compact the user-key range `[begin, end]`; `None` bounds are open.
    ///
    /// Flushes the memtable first, then pushes the range down level by
    /// level to the deepest level that overlaps it. Blocks until done.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.flush_memtable()?;

        let max_level = {
            let state = self.inner.state.lock();
            let current = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        let begin_key =
            begin.map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        let end_key = end.map(|k| InternalKey::new(k, 0, ValueType::Deletion));
        for level in 0..max_level {
            let overlaps = {
                let state = self.inner.state.lock();
                state.versions.current().overlap_in_level(level, begin, end)
            };
            if overlaps {
                self.inner
                    .manual_compaction(level, begin_key.clone(), end_key.clone())?;
            }
        }
        Ok(())
    }

    /// A diagnostic property, or `None` for an unknown name.
    ///
    /// - `strata.num-files-at-level<N>`
    /// - `strata.stats`
    /// - `strata.sstables`
    /// - `strata.approximate-memory-usage`
    pub fn get_property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix("strata.")?;
        let state = self.inner.state.lock();

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let mut out = String::new();
                out.push_str("                               Compactions\n");
                out.push_str("Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n");
                out.push_str("--------------------------------------------------\n");
                const MB: f64 = 1048576.0;
                for level in 0..NUM_LEVELS {
                    let files = state.versions.num_level_files(level);
                    let stats = &state.stats[level];
                    if files > 0 || stats.micros > 0 {
                        let _ = writeln!(
                            out,
                            "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}",
                            level,
                            files,
                            state.versions.num_level_bytes(level) as f64 / MB,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / MB,
                            stats.bytes_written as f64 / MB
                        );
                    }
                }
                Some(out)
            }
            "sstables" => Some(state.versions.current().debug_string()),
            "approximate-memory-usage" => {
                let usage = state.mem.approximate_memory_usage()
                    + state.imm.as_ref().map_or(0, |imm| imm.approximate_memory_usage());
                Some(usage.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk bytes used by each user-key range `[start, limit)`.
    ///
    /// Data still in memtables is not counted.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let current = self.inner.state.lock().versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let start = InternalKey::new(start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let limit = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let begin = current.approximate_offset_of(&start);
                let end = current.approximate_offset_of(&limit);
                end.saturating_sub(begin)
            })
            .collect()
    }

    /// Stop background work, sync the log and release the directory lock.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.bg_thread.lock().take() else {
            return Ok(());
        };
        self.inner.shutting_down.store(true, Ordering::Release);
        {
            let _state = self.inner.state.lock();
            self.inner.bg_cv.notify_all();
        }
        if handle.join().is_err() {
            error!("Background thread panicked");
        }

        let result = match self.inner.log.lock().as_mut() {
            Some(log) => log.sync(),
            None => Ok(()),
        };
        self.lock.lock().take();
        info!(path = %self.inner.dbname.display(), "Closed database");
        result
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Error while closing database");
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.dbname)
            .finish_non_exhaustive()
    }
}

/// Delete the database in `path`.
///
/// The database must not be open. Every file the engine recognises is
/// removed, then the lock file, then the directory if nothing else is left
/// in it. A missing directory is not an error.
pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
    let dbname = path.as_ref();
    let entries = match fs::read_dir(dbname) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let lock = DbLock::acquire(dbname)?;
    let mut result = Ok(());
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_file_name(name) {
            Some((FileType::Lock, _)) | None => {}
            Some(_) => {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(file = name, error = %e, "Failed to delete database file");
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }
    }
    drop(lock);
    let _ = fs::remove_file(lock_file_name(dbname));
    // Fails if the directory holds foreign files, which are left alone
    let _ = fs::remove_dir(dbname);
    info!(path = %dbname.display(), "Destroyed database");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(path: &Path) -> Db {
        Db::open(path, Options::default().with_create_if_missing(true)).unwrap()
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let err = Db::open(&path, Options::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_error_if_exists() {
        let dir = tempdir().unwrap();
        drop(open(dir.path()));
        let options = Options::default().with_error_if_exists(true);
        assert!(matches!(
            Db::open(dir.path(), options),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        assert!(Db::open(dir.path(), Options::default()).is_err());
        db.close().unwrap();
        let reopened = Db::open(dir.path(), Options::default()).unwrap();
        drop(reopened);
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let r = ReadOptions::default();
        let w = WriteOptions::default();

        db.put(b"k1", b"v1", w).unwrap();
        db.put(b"k2", b"v2", w).unwrap();
        assert_eq!(db.get(b"k1", &r).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"missing", &r).unwrap(), None);

        db.put(b"k1", b"v1b", w).unwrap();
        assert_eq!(db.get(b"k1", &r).unwrap(), Some(b"v1b".to_vec()));

        db.delete(b"k1", w).unwrap();
        assert_eq!(db.get(b"k1", &r).unwrap(), None);
        assert_eq!(db.get(b"k2", &r).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_write_returns_snapshot() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        let mut batch = db.new_write_batch();
        batch.put(b"a", b"1").put(b"b", b"2");
        let snapshot = db
            .write(batch, WriteOptions::new().with_snapshot(true))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.sequence(), 2);
        assert!(db.put(b"a", b"3", WriteOptions::default()).unwrap().is_none());

        let at = ReadOptions::new().with_snapshot(snapshot);
        assert_eq!(db.get(b"a", &at).unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            db.get(b"a", &ReadOptions::default()).unwrap(),
            Some(b"3".to_vec())
        );
    }

    #[test]
    fn test_properties() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.put(b"key", b"value", WriteOptions::default()).unwrap();

        assert_eq!(db.get_property("strata.num-files-at-level0").as_deref(), Some("0"));
        assert_eq!(db.get_property("strata.num-files-at-level7"), None);
        assert_eq!(db.get_property("strata.unknown"), None);
        assert_eq!(db.get_property("other.stats"), None);
        let usage: usize = db
            .get_property("strata.approximate-memory-usage")
            .unwrap()
            .parse()
            .unwrap();
        assert!(usage > 0);
        assert!(db.get_property("strata.stats").unwrap().contains("Compactions"));
        assert!(db.get_property("strata.sstables").unwrap().contains("level 0"));
    }

    #[test]
    fn test_compact_range_moves_data_out_of_memtable() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let w = WriteOptions::default();
        for i in 0..100u32 {
            db.put(format!("key{:03}", i).as_bytes(), b"value", w).unwrap();
        }
        db.compact_range(None, None).unwrap();

        let files: usize = (0..NUM_LEVELS)
            .map(|l| {
                db.get_property(&format!("strata.num-files-at-level{}", l))
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .sum();
        assert!(files >= 1);
        assert_eq!(
            db.get(b"key042", &ReadOptions::default()).unwrap(),
            Some(b"value".to_vec())
        );
        let sizes =
            db.approximate_sizes(&[(&b"key000"[..], &b"key999"[..]), (&b"x"[..], &b"y"[..])]);
        assert!(sizes[0] > 0);
        assert_eq!(sizes[1], 0);
    }

    #[test]
    fn test_destroy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = open(&path);
            db.put(b"k", b"v", WriteOptions::default()).unwrap();
        }
        destroy(&path).unwrap();
        assert!(!path.exists());
        destroy(&path).unwrap();
    }
}
