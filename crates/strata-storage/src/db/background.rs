//! Background work: memtable flushes, compactions and file garbage collection.
//!
//! A single thread runs [`background_thread`]. Work is requested through
//! `DbState::bg_compaction_scheduled`; each round flushes a frozen memtable
//! if there is one, otherwise runs one manual or automatic compaction.

use super::{DbInner, DbState, ManualCompaction};
use crate::compaction::{Compaction, CompactionStats};
use crate::filename::{parse_file_name, table_file_name, FileType};
use crate::iterator::InternalIterator;
use crate::key::{parse_internal_key, InternalKey, ValueType};
use crate::memtable::MemTable;
use crate::sstable::SSTableWriter;
use crate::table_cache::TableCache;
use crate::version::Version;
use crate::version_edit::{FileMetaData, VersionEdit};
use parking_lot::MutexGuard;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;
use strata_core::{Error, Options, Result, SequenceNumber, MAX_SEQUENCE_NUMBER};
use tracing::{debug, error, info, trace, warn};

/// Body of the background thread
pub(super) fn background_thread(inner: Arc<DbInner>) {
    debug!("Background thread started");
    let mut state = inner.state.lock();
    loop {
        while !state.bg_compaction_scheduled && !inner.is_shutting_down() {
            inner.bg_cv.wait(&mut state);
        }
        if inner.is_shutting_down() {
            break;
        }
        inner.background_call(&mut state);
    }
    state.bg_compaction_scheduled = false;
    inner.bg_cv.notify_all();
    debug!("Background thread stopped");
}

/// Write the entries of `iter` to table `number`.
///
/// Returns `None` without leaving a file behind if `iter` is empty. On
/// failure the partial file is removed.
pub(super) fn build_table(
    dbname: &Path,
    options: &Options,
    table_cache: &TableCache,
    iter: &mut dyn InternalIterator,
    number: u64,
) -> Result<Option<FileMetaData>> {
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }

    let path = table_file_name(dbname, number);
    let result = (|| -> Result<FileMetaData> {
        let mut writer = SSTableWriter::new(&path, options.block_size, options.compression)?;
        while iter.valid() {
            writer.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;
        let summary = writer.finish()?;
        // Make sure the new table is readable before it is installed
        table_cache.find_table(number)?;
        Ok(FileMetaData::new(
            number,
            summary.file_size,
            InternalKey::decode_from(&summary.smallest),
            InternalKey::decode_from(&summary.largest),
        ))
    })();

    match result {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => {
            table_cache.evict(number);
            let _ = fs::remove_file(&path);
            Err(e)
        }
    }
}

/// Progress of one merging compaction
struct CompactionState {
    compaction: Compaction,
    /// Entries older than this that are shadowed by a newer entry are dropped
    smallest_snapshot: SequenceNumber,
    builder: Option<(u64, SSTableWriter)>,
    outputs: Vec<FileMetaData>,
    /// Every table number allocated for this compaction
    reserved: Vec<u64>,
    total_bytes: u64,
}

impl DbInner {
    /// Wake the background thread if there is work to do
    pub(super) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_compaction_scheduled || self.is_shutting_down() || state.bg_error.is_some() {
            return;
        }
        let manual_pending = state.manual_compaction.as_ref().is_some_and(|m| !m.done);
        if state.imm.is_none() && !manual_pending && !state.versions.needs_compaction() {
            return;
        }
        state.bg_compaction_scheduled = true;
        self.bg_cv.notify_all();
    }

    fn background_call(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_none() {
            if let Err(e) = self.background_compaction(state) {
                if self.is_shutting_down() {
                    debug!(error = %e, "Background work interrupted by shutdown");
                } else {
                    self.record_background_error(state, e);
                }
            }
        }
        state.bg_compaction_scheduled = false;
        // One round may leave more work behind (e.g. too many files in a level)
        self.maybe_schedule_compaction(state);
        self.bg_cv.notify_all();
    }

    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        if state.imm.is_some() {
            return self.compact_memtable(state, true);
        }

        let manual = state
            .manual_compaction
            .as_ref()
            .filter(|m| !m.done)
            .map(|m| (m.id, m.level, m.begin.clone(), m.end.clone()));

        let (compaction, manual_end) = match &manual {
            Some((_, level, begin, end)) => {
                let c = state
                    .versions
                    .compact_range(*level, begin.as_ref(), end.as_ref());
                let manual_end = c
                    .as_ref()
                    .and_then(|c| c.key_range(&c.inputs[0]))
                    .map(|(_, largest)| largest);
                (c, manual_end)
            }
            None => (state.versions.pick_compaction(), None),
        };

        let result = match compaction {
            None => Ok(()),
            Some(mut c) if manual.is_none() && c.is_trivial_move() => {
                let level = c.level();
                let f = Arc::clone(&c.inputs[0][0]);
                c.edit.remove_file(level, f.number);
                c.edit.add_file(
                    level + 1,
                    FileMetaData::new(f.number, f.file_size, f.smallest.clone(), f.largest.clone()),
                );
                let mut edit = std::mem::take(&mut c.edit);
                drop(c);
                let result = self.apply_edit(state, &mut edit);
                match &result {
                    Ok(()) => info!(
                        file = f.number,
                        bytes = f.file_size,
                        to_level = level + 1,
                        summary = %state.versions.level_summary(),
                        "Moved file"
                    ),
                    Err(e) => warn!(file = f.number, error = %e, "Failed to move file"),
                }
                result
            }
            Some(c) => self.run_compaction(state, c),
        };

        if let Some((id, _, _, _)) = manual {
            if let Some(m) = state.manual_compaction.as_mut().filter(|m| m.id == id) {
                match (&result, manual_end) {
                    (Ok(()), Some(end)) => m.begin = Some(end),
                    _ => m.done = true,
                }
            }
        }
        result
    }

    /// Write the frozen memtable to a table and drop the log that held it.
    ///
    /// With `allow_deeper` the table may be placed below level 0; flushes
    /// that interrupt a running compaction always go to level 0.
    pub(super) fn compact_memtable(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        allow_deeper: bool,
    ) -> Result<()> {
        let Some(imm) = state.imm.clone() else {
            return Ok(());
        };
        let base = allow_deeper.then(|| state.versions.current());
        let mut edit = VersionEdit::default();
        self.write_level0_table(state, &imm, &mut edit, base.as_deref())?;

        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        // Earlier logs are no longer needed once the edit is installed
        edit.set_prev_log_number(0);
        edit.set_log_number(state.logfile_number);
        self.apply_edit(state, &mut edit)?;

        state.imm = None;
        self.has_imm.store(false, AtomicOrdering::Release);
        self.remove_obsolete_files(state);
        Ok(())
    }

    /// Write `mem` to a new table and record it in `edit`.
    ///
    /// With a `base` version the table goes to the level chosen by
    /// [`Version::pick_level_for_memtable_output`], otherwise to level 0.
    pub(super) fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<()> {
        let start = Instant::now();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        trace!(table = number, entries = mem.len(), "Flushing memtable");

        let result = MutexGuard::unlocked(state, || {
            let mut iter = mem.iter();
            build_table(&self.dbname, &self.options, &self.table_cache, &mut iter, number)
        });
        state.pending_outputs.remove(&number);

        let mut level = 0;
        let mut written = 0;
        match result {
            Ok(Some(meta)) => {
                if let Some(base) = base {
                    level = base.pick_level_for_memtable_output(
                        meta.smallest.user_key(),
                        meta.largest.user_key(),
                    );
                }
                written = meta.file_size;
                info!(
                    table = number,
                    level,
                    bytes = meta.file_size,
                    "Flushed memtable"
                );
                edit.add_file(level, meta);
            }
            Ok(None) => debug!("Memtable was empty; nothing flushed"),
            Err(e) => {
                error!(table = number, error = %e, "Memtable flush failed");
                return Err(e);
            }
        }

        state.stats[level].add(&CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: 0,
            bytes_written: written,
        });
        Ok(())
    }

    /// Install `edit`, writing its manifest record with the mutex released
    pub(super) fn apply_edit(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let mut pending = state.versions.prepare_apply(edit)?;
        let result = MutexGuard::unlocked(state, || pending.write());
        state.versions.finish_apply(pending, result)
    }

    fn run_compaction(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        compaction: Compaction,
    ) -> Result<()> {
        let start = Instant::now();
        let level = compaction.level();
        info!(
            level,
            inputs = compaction.num_input_files(0),
            next_level_inputs = compaction.num_input_files(1),
            bytes = compaction.input_bytes(),
            "Compacting"
        );

        let last_sequence = state.versions.last_sequence();
        let smallest_snapshot = state.snapshots.oldest().unwrap_or(last_sequence);
        let mut input = state.versions.make_input_iterator(&compaction);
        let mut cs = CompactionState {
            compaction,
            smallest_snapshot,
            builder: None,
            outputs: Vec::new(),
            reserved: Vec::new(),
            total_bytes: 0,
        };

        let merged = MutexGuard::unlocked(state, || self.merge_inputs(&mut cs, input.as_mut()));
        drop(input);

        let result = match merged {
            Ok(imm_micros) => {
                let micros = (start.elapsed().as_micros() as u64).saturating_sub(imm_micros);
                state.stats[level + 1].add(&CompactionStats {
                    micros,
                    bytes_read: cs.compaction.input_bytes(),
                    bytes_written: cs.total_bytes,
                });
                self.install_compaction_results(state, &mut cs)
            }
            Err(e) => Err(e),
        };

        cs.builder = None;
        for number in &cs.reserved {
            state.pending_outputs.remove(number);
        }
        match &result {
            Ok(()) => self.remove_obsolete_files(state),
            Err(e) => {
                warn!(level, error = %e, "Compaction failed");
                let reserved = std::mem::take(&mut cs.reserved);
                MutexGuard::unlocked(state, || {
                    for number in reserved {
                        self.table_cache.evict(number);
                        let _ = fs::remove_file(table_file_name(&self.dbname, number));
                    }
                });
            }
        }
        result
    }

    /// Merge the compaction inputs into new tables.
    ///
    /// Runs without the mutex. Returns the time spent flushing memtables
    /// that filled up meanwhile, which is not charged to the compaction.
    fn merge_inputs(
        &self,
        cs: &mut CompactionState,
        input: &mut dyn InternalIterator,
    ) -> Result<u64> {
        let ucmp = self.icmp.user_comparator();
        let mut imm_micros = 0u64;
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        input.seek_to_first();
        while input.valid() {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let imm_start = Instant::now();
                let mut state = self.state.lock();
                if let Err(e) = self.compact_memtable(&mut state, false) {
                    self.record_background_error(&mut state, e);
                }
                self.bg_cv.notify_all();
                drop(state);
                imm_micros += imm_start.elapsed().as_micros() as u64;
            }

            let key = input.key();
            if cs.compaction.should_stop_before(key) && cs.builder.is_some() {
                self.finish_compaction_output(cs)?;
            }

            let drop_entry = match parse_internal_key(key) {
                None => {
                    // Keep corrupt keys so the damage is not hidden
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    false
                }
                Some(ikey) => {
                    let first_occurrence = match &current_user_key {
                        Some(k) => ucmp.compare(ikey.user_key, k) != Ordering::Equal,
                        None => true,
                    };
                    if first_occurrence {
                        current_user_key = Some(ikey.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    let drop_entry = if last_sequence_for_key <= cs.smallest_snapshot {
                        // Shadowed by a newer entry every snapshot can see
                        true
                    } else {
                        ikey.value_type == ValueType::Deletion
                            && ikey.sequence <= cs.smallest_snapshot
                            && cs.compaction.is_base_level_for_key(ikey.user_key)
                    };
                    last_sequence_for_key = ikey.sequence;
                    drop_entry
                }
            };

            if !drop_entry {
                if cs.builder.is_none() {
                    self.open_compaction_output(cs)?;
                }
                if let Some((_, builder)) = cs.builder.as_mut() {
                    builder.add(key, input.value())?;
                    if builder.file_size() >= cs.compaction.max_output_file_size() {
                        self.finish_compaction_output(cs)?;
                    }
                }
            }
            input.next();
        }

        input.status()?;
        if cs.builder.is_some() {
            self.finish_compaction_output(cs)?;
        }
        Ok(imm_micros)
    }

    fn open_compaction_output(&self, cs: &mut CompactionState) -> Result<()> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        cs.reserved.push(number);
        let writer = SSTableWriter::new(
            table_file_name(&self.dbname, number),
            self.options.block_size,
            self.options.compression,
        )?;
        cs.builder = Some((number, writer));
        Ok(())
    }

    fn finish_compaction_output(&self, cs: &mut CompactionState) -> Result<()> {
        let Some((number, builder)) = cs.builder.take() else {
            return Ok(());
        };
        let entries = builder.num_entries();
        let summary = builder.finish()?;
        cs.total_bytes += summary.file_size;
        self.table_cache.find_table(number)?;
        debug!(
            table = number,
            level = cs.compaction.level() + 1,
            entries,
            bytes = summary.file_size,
            "Generated table"
        );
        cs.outputs.push(FileMetaData::new(
            number,
            summary.file_size,
            InternalKey::decode_from(&summary.smallest),
            InternalKey::decode_from(&summary.largest),
        ));
        Ok(())
    }

    fn install_compaction_results(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        cs: &mut CompactionState,
    ) -> Result<()> {
        let level = cs.compaction.level();
        info!(
            level,
            inputs = cs.compaction.num_input_files(0),
            next_level_inputs = cs.compaction.num_input_files(1),
            outputs = cs.outputs.len(),
            bytes = cs.total_bytes,
            "Compacted"
        );
        cs.compaction.add_input_deletions();
        for f in cs.outputs.drain(..) {
            cs.compaction.edit.add_file(level + 1, f);
        }
        let mut edit = std::mem::take(&mut cs.compaction.edit);
        self.apply_edit(state, &mut edit)?;
        debug!(summary = %state.versions.level_summary(), "Installed compaction");
        Ok(())
    }

    /// Delete files that no live version, pending output or needed log
    /// refers to.
    pub(super) fn remove_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // After an error the state on disk is unknown; keep everything
            return;
        }

        let mut live: HashSet<u64> = state.pending_outputs.clone();
        state.versions.add_live_files(&mut live);
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let entries = match fs::read_dir(&self.dbname) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list database directory");
                return;
            }
        };
        let mut obsolete = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some((file_type, number)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table | FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock => true,
            };
            if !keep {
                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }
                obsolete.push((file_type, number, entry.path()));
            }
        }
        if obsolete.is_empty() {
            return;
        }

        MutexGuard::unlocked(state, || {
            for (file_type, number, path) in obsolete {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(?file_type, number, "Deleted obsolete file"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete obsolete file")
                    }
                }
            }
        });
    }

    /// Compact `[begin, end]` at `level` in as many rounds as it takes.
    ///
    /// Only one manual compaction runs at a time; later callers wait.
    pub(super) fn manual_compaction(
        &self,
        level: usize,
        begin: Option<InternalKey>,
        end: Option<InternalKey>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        while state.manual_compaction.is_some()
            && state.bg_error.is_none()
            && !self.is_shutting_down()
        {
            self.bg_cv.wait(&mut state);
        }
        DbInner::background_error(&state)?;
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let id = state.next_manual_id;
        state.next_manual_id += 1;
        state.manual_compaction = Some(ManualCompaction {
            id,
            level,
            done: false,
            begin,
            end,
        });
        debug!(level, id, "Manual compaction requested");
        self.maybe_schedule_compaction(&mut state);

        loop {
            let done = state
                .manual_compaction
                .as_ref()
                .map_or(true, |m| m.id != id || m.done);
            if done || state.bg_error.is_some() || self.is_shutting_down() {
                break;
            }
            self.bg_cv.wait(&mut state);
            self.maybe_schedule_compaction(&mut state);
        }

        if state.manual_compaction.as_ref().is_some_and(|m| m.id == id) {
            state.manual_compaction = None;
        }
        self.bg_cv.notify_all();

        DbInner::background_error(&state)?;
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Charge a seek for a key an iterator read
    pub(super) fn record_read_sample(&self, version: &Version, internal_key: &[u8]) {
        if version.record_read_sample(internal_key) {
            let mut state = self.state.lock();
            self.maybe_schedule_compaction(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::InternalKeyComparator;
    use strata_core::BytewiseComparator;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_build_table_from_memtable() {
        let dir = tempdir().unwrap();
        let options = Options::default();
        let cache = TableCache::new(dir.path(), icmp(), 10);
        let mem = Arc::new(MemTable::new(icmp()));
        mem.add(1, ValueType::Value, b"b", b"2");
        mem.add(2, ValueType::Value, b"a", b"1");
        mem.add(3, ValueType::Deletion, b"c", b"");

        let mut iter = mem.iter();
        let meta = build_table(dir.path(), &options, &cache, &mut iter, 7)
            .unwrap()
            .unwrap();
        assert_eq!(meta.number, 7);
        assert_eq!(meta.smallest.user_key(), b"a");
        assert_eq!(meta.largest.user_key(), b"c");
        assert_eq!(cache.find_table(7).unwrap().entry_count(), 3);
        assert!(table_file_name(dir.path(), 7).exists());
    }

    #[test]
    fn test_build_table_skips_empty_input() {
        let dir = tempdir().unwrap();
        let cache = TableCache::new(dir.path(), icmp(), 10);
        let mem = Arc::new(MemTable::new(icmp()));
        let mut iter = mem.iter();
        let meta = build_table(dir.path(), &Options::default(), &cache, &mut iter, 3).unwrap();
        assert!(meta.is_none());
        assert!(!table_file_name(dir.path(), 3).exists());
    }
}
