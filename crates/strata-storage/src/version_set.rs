//! Version set - the current version, the manifest and the file counters.
//!
//! Every change to the file layout goes through [`VersionSet::prepare_apply`]
//! / [`PendingApply::write`] / [`VersionSet::finish_apply`]: the new version
//! is built under the engine mutex, the manifest record is written and
//! synced with the mutex released, then the version is installed. Only one
//! apply may be in flight at a time; the engine guarantees this by applying
//! edits from the background thread (or during open) only.

use crate::compaction::{key_range, Compaction};
use crate::filename::{
    descriptor_file_name, parse_file_name, read_current_file, set_current_file, FileType,
};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{InternalKey, InternalKeyComparator};
use crate::table_cache::TableCache;
use crate::version::{total_file_size, LevelFileIterator, Version, VersionBuilder};
use crate::version_edit::{FileMetaData, VersionEdit};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use strata_core::{Error, Options, Result, SequenceNumber, NUM_LEVELS};
use strata_wal::{LogWriter, RecoveryManager};
use tracing::{debug, info, warn};

/// A version edit ready to be written to the manifest
pub struct PendingApply {
    dbname: PathBuf,
    writer: LogWriter,
    record: Vec<u8>,
    /// Number of the manifest created for this apply, if any
    new_manifest: Option<u64>,
    version: Version,
    log_number: u64,
    prev_log_number: u64,
}

impl PendingApply {
    /// Append and sync the record; point CURRENT at a new manifest.
    ///
    /// Runs without the engine mutex.
    pub fn write(&mut self) -> Result<()> {
        self.writer.add_record(&self.record)?;
        self.writer.sync()?;
        if let Some(number) = self.new_manifest {
            set_current_file(&self.dbname, number)?;
        }
        Ok(())
    }
}

/// Owner of the version history and the manifest
pub struct VersionSet {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// Log of a memtable whose flush was in progress; 0 if none
    prev_log_number: u64,
    descriptor_log: Option<LogWriter>,
    current: Arc<Version>,
    /// Every version handed out that may still be pinned
    versions: Vec<Weak<Version>>,
    /// Where the next size compaction of each level starts
    compact_pointer: Vec<Option<InternalKey>>,
}

impl VersionSet {
    /// A version set with an empty current version
    pub fn new(
        dbname: impl Into<PathBuf>,
        options: Arc<Options>,
        table_cache: Arc<TableCache>,
        icmp: InternalKeyComparator,
    ) -> Self {
        let current = Arc::new(Version::new(
            Arc::clone(&table_cache),
            Arc::clone(&options),
            icmp.clone(),
        ));
        Self {
            dbname: dbname.into(),
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: vec![None; NUM_LEVELS],
        }
    }

    /// The current version
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Allocate a file number
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Give back `number` if it was the last one allocated and never used
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Make sure `number` is never allocated again
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Next file number to be allocated
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Number of the live manifest
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Last sequence number in use
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Advance the last sequence number; it never moves backwards
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// Logs numbered below this are obsolete
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Log still needed for an unfinished flush; 0 if none
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    /// Number of files at `level` in the current version
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_level_files(level)
    }

    /// Bytes at `level` in the current version
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.num_level_bytes(level)
    }

    /// `files[ ... ]` summary of the current version
    pub fn level_summary(&self) -> String {
        self.current.level_summary()
    }

    /// True if the current version wants a compaction
    pub fn needs_compaction(&self) -> bool {
        self.current.needs_compaction()
    }

    fn append_version(&mut self, v: Arc<Version>) {
        self.versions.retain(|w| w.strong_count() > 0);
        self.versions.push(Arc::downgrade(&v));
        self.current = v;
    }

    /// Add every file referenced by a live version to `live`
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.versions.retain(|w| w.strong_count() > 0);
        for v in self.versions.iter().filter_map(Weak::upgrade) {
            v.add_live_files(live);
        }
    }

    /// Compute the level most in need of a size compaction
    fn finalize(&self, v: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0;
        let config = &self.options.compaction;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count rather than bytes: level-0 files overlap, so
                // every read merges all of them
                v.num_level_files(0) as f64 / config.l0_compaction_trigger as f64
            } else {
                v.num_level_bytes(level) as f64 / config.max_bytes_for_level(level) as f64
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        v.compaction_level = best_level;
        v.compaction_score = best_score;
    }

    /// Build the version that results from `edit` and stage its manifest record.
    pub fn prepare_apply(&mut self, edit: &mut VersionEdit) -> Result<PendingApply> {
        match edit.log_number {
            Some(n) if n < self.log_number || n >= self.next_file_number => {
                return Err(Error::Corruption(format!(
                    "version edit log number {} outside [{}, {})",
                    n, self.log_number, self.next_file_number
                )));
            }
            Some(_) => {}
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = VersionBuilder::new(Arc::clone(&self.current));
        builder.apply(edit)?;
        let mut version = builder.new_version();
        builder.save_to(&mut version);
        self.finalize(&mut version);

        for (level, key) in &edit.compact_pointers {
            self.compact_pointer[*level] = Some(key.clone());
        }

        let (writer, new_manifest) = match self.descriptor_log.take() {
            Some(writer) => (writer, None),
            None => {
                // First apply since open: start a manifest holding a
                // snapshot of the current version
                let number = self.manifest_file_number;
                let path = descriptor_file_name(&self.dbname, number);
                let mut writer = LogWriter::create(&path)?;
                if let Err(e) = self.write_snapshot(&mut writer) {
                    drop(writer);
                    let _ = std::fs::remove_file(&path);
                    return Err(e);
                }
                info!(manifest = number, "Created manifest");
                (writer, Some(number))
            }
        };

        Ok(PendingApply {
            dbname: self.dbname.clone(),
            writer,
            record: edit.encode()?,
            new_manifest,
            version,
            log_number: edit.log_number.unwrap_or(self.log_number),
            prev_log_number: edit.prev_log_number.unwrap_or(self.prev_log_number),
        })
    }

    /// Install the staged version if its record was written.
    pub fn finish_apply(&mut self, pending: PendingApply, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.descriptor_log = Some(pending.writer);
                self.log_number = pending.log_number;
                self.prev_log_number = pending.prev_log_number;
                self.append_version(Arc::new(pending.version));
                debug!(summary = %self.current.level_summary(), "Installed version");
                Ok(())
            }
            Err(e) => {
                match pending.new_manifest {
                    Some(number) => {
                        drop(pending.writer);
                        let _ = std::fs::remove_file(descriptor_file_name(&self.dbname, number));
                    }
                    None => self.descriptor_log = Some(pending.writer),
                }
                warn!(error = %e, "Failed to write manifest record");
                Err(e)
            }
        }
    }

    /// Apply `edit` without releasing any lock.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let mut pending = self.prepare_apply(edit)?;
        let result = pending.write();
        self.finish_apply(pending, result)
    }

    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_format_header();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for f in self.current.files(level) {
                edit.add_file(level, FileMetaData::clone(f));
            }
        }
        writer.add_record(&edit.encode()?)
    }

    /// Load the manifest named by CURRENT.
    ///
    /// Returns true if a new manifest must be written (the old one is not
    /// being reused).
    pub fn recover(&mut self) -> Result<bool> {
        let current_name = read_current_file(&self.dbname)?;
        let manifest_path = self.dbname.join(&current_name);

        let mut builder = VersionBuilder::new(Arc::clone(&self.current));
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut compact_pointers = Vec::new();
        let comparator_name = self.icmp.user_comparator().name().to_string();

        let stats = RecoveryManager::new(&manifest_path, true).replay(|record| {
            let edit = VersionEdit::decode(record)?;
            if let Some(name) = &edit.comparator {
                if *name != comparator_name {
                    return Err(Error::InvalidArgument(format!(
                        "comparator {} does not match existing comparator {}",
                        comparator_name, name
                    )));
                }
            }
            builder.apply(&edit)?;
            compact_pointers.extend(edit.compact_pointers.iter().cloned());
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
            Ok(())
        })?;

        let next_file_number = next_file_number.ok_or_else(|| {
            Error::Corruption("no next-file-number entry in manifest".to_string())
        })?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("no log-number entry in manifest".to_string()))?;
        let last_sequence = last_sequence.ok_or_else(|| {
            Error::Corruption("no last-sequence entry in manifest".to_string())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.new_version();
        builder.save_to(&mut version);
        self.finalize(&mut version);
        self.append_version(Arc::new(version));

        for (level, key) in compact_pointers {
            if let Some(slot) = self.compact_pointer.get_mut(level) {
                *slot = Some(key);
            }
        }
        self.next_file_number = next_file_number;
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);
        self.manifest_file_number = self.new_file_number();
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence = last_sequence;

        info!(
            manifest = %current_name,
            edits = stats.records,
            next_file = self.next_file_number,
            last_sequence,
            log_number,
            summary = %self.current.level_summary(),
            "Recovered manifest"
        );

        if self.reuse_manifest(&manifest_path, &current_name) {
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn reuse_manifest(&mut self, path: &Path, name: &str) -> bool {
        if !self.options.reuse_logs {
            return false;
        }
        let Some((FileType::Descriptor, number)) = parse_file_name(name) else {
            return false;
        };
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        // Start a fresh, compacted manifest once the old one grows large
        if size >= self.options.max_file_size {
            return false;
        }
        match LogWriter::append_to(path) {
            Ok(writer) => {
                info!(manifest = %name, size, "Reusing manifest");
                self.descriptor_log = Some(writer);
                self.manifest_file_number = number;
                true
            }
            Err(e) => {
                warn!(manifest = %name, error = %e, "Cannot reuse manifest");
                false
            }
        }
    }

    /// Pick the next size or seek compaction, if any is due.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let mut c = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            let files = current.files(level);
            // First file past the compaction pointer, wrapping around
            let pointer = self.compact_pointer[level].as_ref();
            let picked = files
                .iter()
                .find(|f| {
                    pointer.map_or(true, |p| {
                        self.icmp.compare_keys(&f.largest, p) == Ordering::Greater
                    })
                })
                .or_else(|| files.first())?;
            let mut c = Compaction::new(
                level,
                Arc::clone(&current),
                &self.options,
                self.icmp.clone(),
            );
            c.inputs[0].push(Arc::clone(picked));
            c
        } else if let Some((file, level)) = current.file_to_compact() {
            let mut c = Compaction::new(
                level,
                Arc::clone(&current),
                &self.options,
                self.icmp.clone(),
            );
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        // Level-0 files overlap each other; take every one in the range
        if c.level() == 0 {
            let (smallest, largest) = key_range(&self.icmp, &c.inputs[0])?;
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// A compaction of the files at `level` overlapping `[begin, end]`.
    ///
    /// Above level 0 the inputs are cut after about one output file worth
    /// of data, so a large manual range is compacted in several steps.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = Arc::clone(&self.current);
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0;
            for i in 0..inputs.len() {
                total += inputs[i].file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(level, current, &self.options, self.icmp.clone());
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = Arc::clone(&c.input_version);
        let level = c.level();

        add_boundary_inputs(&self.icmp, current.files(level), &mut c.inputs[0]);
        let Some((smallest, mut largest)) = key_range(&self.icmp, &c.inputs[0]) else {
            return;
        };

        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, current.files(level + 1), &mut c.inputs[1]);

        let all: Vec<_> = c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
        let Some((mut all_start, mut all_limit)) = key_range(&self.icmp, &all) else {
            return;
        };

        // Try to grow the level inputs without changing the next-level inputs
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, current.files(level), &mut expanded0);
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < self.options.expanded_compaction_byte_limit()
            {
                if let Some((new_start, new_limit)) = key_range(&self.icmp, &expanded0) {
                    let mut expanded1 = current.get_overlapping_inputs(
                        level + 1,
                        Some(&new_start),
                        Some(&new_limit),
                    );
                    add_boundary_inputs(&self.icmp, current.files(level + 1), &mut expanded1);
                    if expanded1.len() == c.inputs[1].len() {
                        info!(
                            level,
                            from_files = c.inputs[0].len(),
                            from_bytes = inputs0_size,
                            to_files = expanded0.len(),
                            to_bytes = expanded0_size,
                            next_files = c.inputs[1].len(),
                            next_bytes = inputs1_size,
                            "Expanding compaction inputs"
                        );
                        largest = new_limit;
                        c.inputs[0] = expanded0;
                        c.inputs[1] = expanded1;
                        let all: Vec<_> =
                            c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
                        if let Some((start, limit)) = key_range(&self.icmp, &all) {
                            all_start = start;
                            all_limit = limit;
                        }
                    }
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Advance the pointer now rather than when the edit is applied, so a
        // failed compaction is retried on a different range
        self.compact_pointer[level] = Some(largest.clone());
        c.edit.set_compact_pointer(level, largest);
    }

    /// Merged cursor over every input of `c`, with checksums verified
    pub fn make_input_iterator(&self, c: &Compaction) -> Box<dyn InternalIterator> {
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for which in 0..2 {
            let files = &c.inputs[which];
            if files.is_empty() {
                continue;
            }
            if c.level() + which == 0 {
                for f in files {
                    children.push(self.table_cache.get_iterator(f.number, true));
                }
            } else {
                children.push(Box::new(LevelFileIterator::new(
                    self.icmp.clone(),
                    files.clone(),
                    Arc::clone(&self.table_cache),
                    true,
                )));
            }
        }
        Box::new(MergingIterator::new(self.icmp.clone(), children))
    }
}

/// Extend `compaction_files` with files of the same level whose smallest
/// key shares a user key with the current largest input.
///
/// Without this, an older version of a key could stay behind in `level`
/// while a newer one moves down, and reads would find the older one first.
pub fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    let Some((_, mut largest)) = key_range(icmp, compaction_files) else {
        return;
    };
    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest) {
        largest = boundary.largest.clone();
        compaction_files.push(boundary);
    }
}

fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let mut smallest_boundary: Option<&Arc<FileMetaData>> = None;
    for f in level_files {
        if icmp.compare_keys(&f.smallest, largest) == Ordering::Greater
            && icmp.compare_user(f.smallest.user_key(), largest.user_key()) == Ordering::Equal
        {
            let better = smallest_boundary.map_or(true, |b| {
                icmp.compare_keys(&f.smallest, &b.smallest) == Ordering::Less
            });
            if better {
                smallest_boundary = Some(f);
            }
        }
    }
    smallest_boundary.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filename::current_file_name;
    use crate::key::ValueType;
    use strata_core::BytewiseComparator;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &str, seq: u64) -> InternalKey {
        InternalKey::new(user_key.as_bytes(), seq, ValueType::Value)
    }

    fn new_set(dir: &Path, options: Options) -> VersionSet {
        let options = Arc::new(options);
        let cache = Arc::new(TableCache::new(dir, icmp(), 10));
        VersionSet::new(dir, options, cache, icmp())
    }

    /// Create a fresh manifest the way a new database does
    fn create_db(dir: &Path) {
        let mut edit = VersionEdit::default();
        edit.set_format_header();
        edit.set_comparator_name("strata.BytewiseComparator");
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);
        let mut writer = LogWriter::create(&descriptor_file_name(dir, 1)).unwrap();
        writer.add_record(&edit.encode().unwrap()).unwrap();
        writer.sync().unwrap();
        set_current_file(dir, 1).unwrap();
    }

    fn file(number: u64, smallest: &str, largest: &str, size: u64) -> FileMetaData {
        FileMetaData::new(number, size, ikey(smallest, 5), ikey(largest, 5))
    }

    #[test]
    fn test_recover_and_apply() {
        let dir = tempdir().unwrap();
        create_db(dir.path());

        let mut vset = new_set(dir.path(), Options::default());
        assert!(vset.recover().unwrap());
        assert_eq!(vset.manifest_file_number(), 2);

        let number = vset.new_file_number();
        let mut edit = VersionEdit::default();
        edit.add_file(0, file(number, "a", "m", 100));
        vset.set_last_sequence(42);
        vset.log_and_apply(&mut edit).unwrap();
        assert_eq!(vset.num_level_files(0), 1);
        assert_eq!(
            std::fs::read_to_string(current_file_name(dir.path())).unwrap(),
            "MANIFEST-000002\n"
        );

        let mut reopened = new_set(dir.path(), Options::default());
        reopened.recover().unwrap();
        assert_eq!(reopened.num_level_files(0), 1);
        assert_eq!(reopened.last_sequence(), 42);
        assert!(reopened.next_file_number() > number);
    }

    #[test]
    fn test_recover_rejects_other_comparator() {
        struct Reverse;
        impl strata_core::Comparator for Reverse {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
            fn name(&self) -> &str {
                "test.Reverse"
            }
        }

        let dir = tempdir().unwrap();
        create_db(dir.path());
        let cmp = InternalKeyComparator::new(Arc::new(Reverse));
        let options = Arc::new(Options::default());
        let cache = Arc::new(TableCache::new(dir.path(), cmp.clone(), 10));
        let mut vset = VersionSet::new(dir.path(), options, cache, cmp);
        assert!(matches!(vset.recover(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reuse_manifest() {
        let dir = tempdir().unwrap();
        create_db(dir.path());
        let mut vset = new_set(dir.path(), Options::default().with_reuse_logs(true));
        assert!(!vset.recover().unwrap());
        assert_eq!(vset.manifest_file_number(), 1);

        let mut edit = VersionEdit::default();
        vset.log_and_apply(&mut edit).unwrap();
        assert!(!descriptor_file_name(dir.path(), 2).exists());
    }

    #[test]
    fn test_pick_level0_compaction() {
        let dir = tempdir().unwrap();
        create_db(dir.path());
        let mut vset = new_set(dir.path(), Options::default());
        vset.recover().unwrap();

        let mut edit = VersionEdit::default();
        for (i, (s, l)) in [("a", "c"), ("b", "d"), ("c", "e"), ("x", "z")].iter().enumerate() {
            edit.add_file(0, file(10 + i as u64, s, l, 100));
        }
        edit.add_file(1, file(20, "d", "f", 100));
        edit.add_file(1, file(21, "y", "y", 100));
        vset.mark_file_number_used(30);
        vset.log_and_apply(&mut edit).unwrap();
        assert!(vset.needs_compaction());

        let c = vset.pick_compaction().unwrap();
        assert_eq!(c.level(), 0);
        let mut inputs0: Vec<u64> = c.inputs[0].iter().map(|f| f.number).collect();
        inputs0.sort();
        assert_eq!(inputs0, vec![10, 11, 12]);
        let inputs1: Vec<u64> = c.inputs[1].iter().map(|f| f.number).collect();
        assert_eq!(inputs1, vec![20]);
        assert_eq!(c.edit.compact_pointers.len(), 1);
    }

    #[test]
    fn test_compact_range_limits_inputs() {
        let dir = tempdir().unwrap();
        create_db(dir.path());
        let mut vset = new_set(dir.path(), Options::default().with_max_file_size(250));
        vset.recover().unwrap();

        let mut edit = VersionEdit::default();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            edit.add_file(1, file(10 + i as u64, k, k, 100));
        }
        vset.mark_file_number_used(20);
        vset.log_and_apply(&mut edit).unwrap();

        let c = vset.compact_range(1, None, None).unwrap();
        assert_eq!(c.num_input_files(0), 3);
        assert!(vset.compact_range(2, None, None).is_none());
    }

    #[test]
    fn test_boundary_inputs() {
        let files: Vec<Arc<FileMetaData>> = vec![
            Arc::new(FileMetaData::new(1, 1, ikey("a", 5), ikey("k", 7))),
            Arc::new(FileMetaData::new(2, 1, ikey("k", 6), ikey("k", 3))),
            Arc::new(FileMetaData::new(3, 1, ikey("k", 2), ikey("p", 1))),
            Arc::new(FileMetaData::new(4, 1, ikey("q", 9), ikey("r", 1))),
        ];
        let mut picked = vec![Arc::clone(&files[0])];
        add_boundary_inputs(&icmp(), &files, &mut picked);
        let numbers: Vec<u64> = picked.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_live_files_include_pinned_versions() {
        let dir = tempdir().unwrap();
        create_db(dir.path());
        let mut vset = new_set(dir.path(), Options::default());
        vset.recover().unwrap();

        let mut edit = VersionEdit::default();
        edit.add_file(1, file(10, "a", "b", 100));
        vset.mark_file_number_used(10);
        vset.log_and_apply(&mut edit).unwrap();
        let pinned = vset.current();

        let mut edit = VersionEdit::default();
        edit.remove_file(1, 10);
        vset.log_and_apply(&mut edit).unwrap();

        let mut live = HashSet::new();
        vset.add_live_files(&mut live);
        assert!(live.contains(&10));

        drop(pinned);
        let mut live = HashSet::new();
        vset.add_live_files(&mut live);
        assert!(!live.contains(&10));
    }
}
