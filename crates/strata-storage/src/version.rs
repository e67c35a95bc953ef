//! Versions - immutable snapshots of the file layout.
//!
//! A [`Version`] lists the table files of every level. Readers pin the
//! current version by holding its `Arc`; files referenced by any pinned
//! version are never deleted.

use crate::iterator::InternalIterator;
use crate::key::{
    parse_internal_key, InternalKey, InternalKeyComparator, LookupKey, LookupResult, ValueType,
    VALUE_TYPE_FOR_SEEK,
};
use crate::table_cache::TableCache;
use crate::version_edit::{FileMetaData, VersionEdit};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use strata_core::{Error, Options, Result, MAX_SEQUENCE_NUMBER, NUM_LEVELS};

/// Total bytes of `files`
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Index of the first file whose largest key is >= `key`.
///
/// `files` must be sorted and non-overlapping.
pub fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encoded(), key) == Ordering::Less)
}

fn after_file(icmp: &InternalKeyComparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None means the key is before every key
    user_key.is_some_and(|k| icmp.compare_user(k, f.largest.user_key()) == Ordering::Greater)
}

fn before_file(icmp: &InternalKeyComparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None means the key is after every key
    user_key.is_some_and(|k| icmp.compare_user(k, f.smallest.user_key()) == Ordering::Less)
}

/// True if some file in `files` overlaps the user-key range
/// `[smallest, largest]`; `None` bounds are open.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest: Option<&[u8]>,
    largest: Option<&[u8]>,
) -> bool {
    if !disjoint {
        return files
            .iter()
            .any(|f| !after_file(icmp, smallest, f) && !before_file(icmp, largest, f));
    }

    let index = match smallest {
        Some(s) => {
            let small = InternalKey::new(s, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encoded())
        }
        None => 0,
    };
    match files.get(index) {
        Some(f) => !before_file(icmp, largest, f),
        None => false,
    }
}

/// The file whose seek budget a lookup charged
#[derive(Default)]
pub struct GetStats {
    /// First file probed when the lookup had to probe more than one
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

/// An immutable set of table files per level
pub struct Version {
    pub(crate) files: Vec<Vec<Arc<FileMetaData>>>,
    /// Level that most needs a size compaction, with its score
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
    /// File nominated by the seek trigger
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
    table_cache: Arc<TableCache>,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
}

impl Version {
    /// An empty version
    pub fn new(
        table_cache: Arc<TableCache>,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
    ) -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
            table_cache,
            options,
            icmp,
        }
    }

    /// Files of `level`, sorted by smallest key
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Number of files at `level`
    pub fn num_level_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Total bytes at `level`
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    /// The file nominated by the seek trigger, if any
    pub fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().clone()
    }

    /// True if a size or seek compaction is due
    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().is_some()
    }

    /// Look up `lookup` in the table files.
    ///
    /// Level-0 files may overlap, so every one that covers the key is
    /// probed newest first; deeper levels hold at most one candidate.
    pub fn get(
        &self,
        verify_checksums: bool,
        lookup: &LookupKey,
    ) -> Result<(Option<LookupResult>, GetStats)> {
        let ikey = lookup.internal_key();
        let user_key = lookup.user_key();
        let mut stats = GetStats::default();
        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<&Arc<FileMetaData>> = if level == 0 {
                let mut overlapping: Vec<_> = files
                    .iter()
                    .filter(|f| {
                        self.icmp.compare_user(user_key, f.smallest.user_key()) != Ordering::Less
                            && self.icmp.compare_user(user_key, f.largest.user_key())
                                != Ordering::Greater
                    })
                    .collect();
                overlapping.sort_by(|a, b| b.number.cmp(&a.number));
                overlapping
            } else {
                let index = find_file(&self.icmp, files, ikey);
                match files.get(index) {
                    Some(f)
                        if self.icmp.compare_user(user_key, f.smallest.user_key())
                            != Ordering::Less =>
                    {
                        vec![f]
                    }
                    _ => Vec::new(),
                }
            };

            for f in candidates {
                if stats.seek_file.is_none() {
                    if let Some(previous) = last_file_read.take() {
                        stats.seek_file = Some(previous);
                    }
                }
                last_file_read = Some((Arc::clone(f), level));

                let Some((found_key, value)) =
                    self.table_cache.get(f.number, ikey, verify_checksums)?
                else {
                    continue;
                };
                let parsed = parse_internal_key(&found_key).ok_or_else(|| {
                    Error::Corruption(format!("bad internal key in table #{}", f.number))
                })?;
                if self.icmp.compare_user(parsed.user_key, user_key) == Ordering::Equal {
                    let result = match parsed.value_type {
                        ValueType::Value => LookupResult::Value(value),
                        ValueType::Deletion => LookupResult::Deleted,
                    };
                    return Ok((Some(result), stats));
                }
            }
        }
        Ok((None, stats))
    }

    /// Charge a seek to the file recorded in `stats`.
    ///
    /// Returns true when the file's budget ran out and it became the seek
    /// compaction candidate, so the caller should schedule work.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        if !self.options.compaction.seek_compaction {
            return false;
        }
        let Some((file, level)) = stats.seek_file else {
            return false;
        };
        let left = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        let mut slot = self.file_to_compact.lock();
        if left <= 0 && slot.is_none() {
            *slot = Some((file, level));
            return true;
        }
        false
    }

    /// Sample a key read by an iterator.
    ///
    /// If more than one file holds the key's user key, the first one is
    /// charged a seek. Returns true if a compaction should be scheduled.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Some(parsed) = parse_internal_key(internal_key) else {
            return false;
        };
        let mut matches = 0;
        let mut first: Option<(Arc<FileMetaData>, usize)> = None;
        for level in 0..NUM_LEVELS {
            for f in self.files_covering(level, parsed.user_key, internal_key) {
                matches += 1;
                if first.is_none() {
                    first = Some((Arc::clone(f), level));
                }
                if matches >= 2 {
                    return self.update_stats(GetStats { seek_file: first });
                }
            }
        }
        false
    }

    fn files_covering<'a>(
        &'a self,
        level: usize,
        user_key: &[u8],
        internal_key: &[u8],
    ) -> Vec<&'a Arc<FileMetaData>> {
        let files = &self.files[level];
        if level == 0 {
            let mut covering: Vec<_> = files
                .iter()
                .filter(|f| {
                    self.icmp.compare_user(user_key, f.smallest.user_key()) != Ordering::Less
                        && self.icmp.compare_user(user_key, f.largest.user_key())
                            != Ordering::Greater
                })
                .collect();
            covering.sort_by(|a, b| b.number.cmp(&a.number));
            return covering;
        }
        let index = find_file(&self.icmp, files, internal_key);
        match files.get(index) {
            Some(f)
                if self.icmp.compare_user(user_key, f.smallest.user_key()) != Ordering::Less =>
            {
                vec![f]
            }
            _ => Vec::new(),
        }
    }

    /// True if some file at `level` overlaps the user-key range
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(&self.icmp, level > 0, &self.files[level], smallest, largest)
    }

    /// Files at `level` overlapping the user-key range of `[begin, end]`.
    ///
    /// At level 0 the range grows to cover every file that overlaps a file
    /// already picked, so that no newer version of a key is left behind.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());
        let mut inputs = Vec::new();

        let files = &self.files[level];
        let mut i = 0;
        while i < files.len() {
            let f = &files[i];
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if user_begin
                .as_deref()
                .is_some_and(|b| self.icmp.compare_user(file_limit, b) == Ordering::Less)
            {
                continue;
            }
            if user_end
                .as_deref()
                .is_some_and(|e| self.icmp.compare_user(file_start, e) == Ordering::Greater)
            {
                continue;
            }

            inputs.push(Arc::clone(f));
            if level == 0 {
                // Restart the scan if this file widens the range
                if user_begin
                    .as_deref()
                    .is_some_and(|b| self.icmp.compare_user(file_start, b) == Ordering::Less)
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|e| self.icmp.compare_user(file_limit, e) == Ordering::Greater)
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Level a flushed memtable covering `[smallest, largest]` should land in.
    ///
    /// The output is pushed below level 0 while it overlaps nothing in the
    /// next level and not too much in the one after.
    pub fn pick_level_for_memtable_output(&self, smallest: &[u8], largest: &[u8]) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest), Some(largest)) {
            return level;
        }

        let start = InternalKey::new(smallest, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest, 0, ValueType::Deletion);
        while level < self.options.compaction.max_mem_compact_level {
            if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps) > self.options.max_grandparent_overlap_bytes() {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Append cursors over every file to `iters`: one per level-0 file and
    /// one concatenating cursor per deeper level.
    pub fn add_iterators(
        &self,
        verify_checksums: bool,
        iters: &mut Vec<Box<dyn InternalIterator>>,
    ) {
        for f in &self.files[0] {
            iters.push(self.table_cache.get_iterator(f.number, verify_checksums));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(LevelFileIterator::new(
                    self.icmp.clone(),
                    self.files[level].clone(),
                    Arc::clone(&self.table_cache),
                    verify_checksums,
                )));
            }
        }
    }

    /// Add every file number to `live`
    pub fn add_live_files(&self, live: &mut HashSet<u64>) {
        for level in &self.files {
            for f in level {
                live.insert(f.number);
            }
        }
    }

    /// Approximate byte offset of `key` within the data of this version
    pub fn approximate_offset_of(&self, key: &InternalKey) -> u64 {
        let mut result = 0;
        for level in 0..NUM_LEVELS {
            for f in &self.files[level] {
                if self.icmp.compare_keys(&f.largest, key) != Ordering::Greater {
                    result += f.file_size;
                } else if self.icmp.compare_keys(&f.smallest, key) == Ordering::Greater {
                    // Files past this one start even later
                    if level > 0 {
                        break;
                    }
                } else {
                    result += self.table_cache.approximate_offset_of(f.number, key.encoded());
                }
            }
        }
        result
    }

    /// `files[ n0 n1 ... ]`
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self.files.iter().map(|l| l.len().to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// Per-level file listing
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            let _ = writeln!(out, "--- level {} ---", level);
            for f in files {
                let _ = writeln!(out, " {:?}", f);
            }
        }
        out
    }
}

/// Cursor over the non-overlapping files of one level, opened lazily
pub struct LevelFileIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    verify_checksums: bool,
    index: usize,
    current: Option<Box<dyn InternalIterator>>,
    status: Result<()>,
}

impl LevelFileIterator {
    /// Concatenate `files`
    pub fn new(
        icmp: InternalKeyComparator,
        files: Vec<Arc<FileMetaData>>,
        table_cache: Arc<TableCache>,
        verify_checksums: bool,
    ) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            table_cache,
            verify_checksums,
            index,
            current: None,
            status: Ok(()),
        }
    }

    fn open_file(&mut self, index: usize) {
        self.save_status();
        self.index = index;
        self.current = self
            .files
            .get(index)
            .map(|f| self.table_cache.get_iterator(f.number, self.verify_checksums));
    }

    /// Keep the first error seen by a file cursor that is being replaced
    fn save_status(&mut self) {
        if self.status.is_err() {
            return;
        }
        if let Some(Err(e)) = self.current.as_ref().map(|c| c.status()) {
            self.status = Err(e);
        }
    }

    fn current_valid(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.valid())
    }

    fn skip_empty_files_forward(&mut self) {
        while self.current.is_some() && !self.current_valid() {
            if self.index + 1 >= self.files.len() {
                self.save_status();
                self.current = None;
                self.index = self.files.len();
                return;
            }
            self.open_file(self.index + 1);
            if let Some(current) = self.current.as_mut() {
                current.seek_to_first();
            }
        }
    }

    fn skip_empty_files_backward(&mut self) {
        while self.current.is_some() && !self.current_valid() {
            if self.index == 0 {
                self.save_status();
                self.current = None;
                self.index = self.files.len();
                return;
            }
            self.open_file(self.index - 1);
            if let Some(current) = self.current.as_mut() {
                current.seek_to_last();
            }
        }
    }
}

impl InternalIterator for LevelFileIterator {
    fn valid(&self) -> bool {
        self.current_valid()
    }

    fn seek_to_first(&mut self) {
        self.open_file(0);
        if let Some(current) = self.current.as_mut() {
            current.seek_to_first();
        }
        self.skip_empty_files_forward();
    }

    fn seek_to_last(&mut self) {
        match self.files.len() {
            0 => self.open_file(0),
            n => self.open_file(n - 1),
        }
        if let Some(current) = self.current.as_mut() {
            current.seek_to_last();
        }
        self.skip_empty_files_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        let index = find_file(&self.icmp, &self.files, target);
        self.open_file(index);
        if let Some(current) = self.current.as_mut() {
            current.seek(target);
        }
        self.skip_empty_files_forward();
    }

    fn next(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.next();
        }
        self.skip_empty_files_forward();
    }

    fn prev(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.prev();
        }
        self.skip_empty_files_backward();
    }

    fn key(&self) -> &[u8] {
        match &self.current {
            Some(current) => current.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.current {
            Some(current) => current.value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        match &self.current {
            Some(current) => current.status(),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

/// Accumulates edits on top of a base version
pub struct VersionBuilder {
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

impl VersionBuilder {
    /// Start from `base`
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            levels: (0..NUM_LEVELS).map(|_| LevelState::default()).collect(),
        }
    }

    /// Apply the file changes of `edit`
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        for &(level, number) in &edit.deleted_files {
            self.level_mut(level)?.deleted.insert(number);
        }

        let compaction = &self.base.options.compaction;
        let (bytes_per_seek, min_allowed_seeks) =
            (compaction.bytes_per_seek, compaction.min_allowed_seeks);
        for (level, file) in &edit.new_files {
            let file = file.clone();
            // One seek costs about as much as compacting bytes_per_seek bytes
            let allowed = (file.file_size / bytes_per_seek) as i64;
            file.allowed_seeks
                .store(allowed.max(min_allowed_seeks), AtomicOrdering::Relaxed);
            let state = self.level_mut(*level)?;
            state.deleted.remove(&file.number);
            state.added.push(Arc::new(file));
        }
        Ok(())
    }

    fn level_mut(&mut self, level: usize) -> Result<&mut LevelState> {
        self.levels
            .get_mut(level)
            .ok_or_else(|| Error::Corruption(format!("version edit names level {}", level)))
    }

    /// Produce the files of the new version into `v`
    pub fn save_to(&self, v: &mut Version) {
        let icmp = &self.base.icmp;
        for level in 0..NUM_LEVELS {
            let state = &self.levels[level];
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .chain(state.added.iter())
                .filter(|f| !state.deleted.contains(&f.number))
                .cloned()
                .collect();
            files.sort_by(|a, b| {
                icmp.compare_keys(&a.smallest, &b.smallest)
                    .then(a.number.cmp(&b.number))
            });
            if level > 0 {
                debug_assert!(
                    files.windows(2).all(|w| icmp
                        .compare_keys(&w[0].largest, &w[1].smallest)
                        == Ordering::Less),
                    "overlapping files at level {}",
                    level
                );
            }
            v.files[level] = files;
        }
    }

    /// Fresh version sharing the base's cache and options
    pub fn new_version(&self) -> Version {
        Version::new(
            Arc::clone(&self.base.table_cache),
            Arc::clone(&self.base.options),
            self.base.icmp.clone(),
        )
    }
}
