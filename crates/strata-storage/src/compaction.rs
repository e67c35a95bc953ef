//! Compaction - the unit of background merging.
//!
//! A [`Compaction`] names the input files of `level` and `level + 1`, the
//! overlapping grandparent files used to cut outputs, and the edit that
//! will install the result. Choosing inputs happens in the version set;
//! running the merge happens in the engine.

use crate::key::{InternalKey, InternalKeyComparator};
use crate::version::{total_file_size, Version};
use crate::version_edit::{FileMetaData, VersionEdit};
use std::cmp::Ordering;
use std::sync::Arc;
use strata_core::{Options, NUM_LEVELS};

/// Statistics for the compactions that wrote into one level
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    /// Wall time spent
    pub micros: u64,
    /// Bytes of input files
    pub bytes_read: u64,
    /// Bytes of output files
    pub bytes_written: u64,
}

impl CompactionStats {
    /// Accumulate `other`
    pub fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// A compaction of `level` into `level + 1`
pub struct Compaction {
    level: usize,
    /// Version the inputs were picked from; pinned until the compaction ends
    pub(crate) input_version: Arc<Version>,
    /// Changes to install on success
    pub(crate) edit: VersionEdit,
    /// `inputs[0]` from `level`, `inputs[1]` from `level + 1`
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files of `level + 2` overlapping the compaction range
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    /// Per-level cursor for `is_base_level_for_key`
    level_ptrs: [usize; NUM_LEVELS],
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    icmp: InternalKeyComparator,
}

impl Compaction {
    /// An empty compaction of `level` against `input_version`
    pub fn new(
        level: usize,
        input_version: Arc<Version>,
        options: &Options,
        icmp: InternalKeyComparator,
    ) -> Self {
        Self {
            level,
            input_version,
            edit: VersionEdit::default(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: options.max_grandparent_overlap_bytes(),
            icmp,
        }
    }

    /// Level being compacted; outputs go to `level() + 1`
    pub fn level(&self) -> usize {
        self.level
    }

    /// Number of input files from `level() + which`
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// Target size of each output file
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// Total bytes of all inputs
    pub fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// True if the single input file can move to the next level without a merge.
    ///
    /// A move that would leave a file with heavy grandparent overlap is
    /// merged instead, to avoid a very expensive compaction later.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Record the deletion of every input in the edit
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.remove_file(self.level + which, f.number);
            }
        }
    }

    /// True if no level below the output level can hold `user_key`.
    ///
    /// Calls must come in increasing key order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if self.icmp.compare_user(user_key, f.largest.user_key()) != Ordering::Greater {
                    if self.icmp.compare_user(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True if the current output file should be closed before `internal_key`
    /// because it already overlaps too many grandparent bytes.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Smallest and largest internal key over `files`
    pub fn key_range(&self, files: &[Arc<FileMetaData>]) -> Option<(InternalKey, InternalKey)> {
        key_range(&self.icmp, files)
    }
}

/// Smallest and largest internal key over `files`; `None` if empty
pub fn key_range(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
) -> Option<(InternalKey, InternalKey)> {
    let first = files.first()?;
    let mut smallest = &first.smallest;
    let mut largest = &first.largest;
    for f in &files[1..] {
        if icmp.compare_keys(&f.smallest, smallest) == Ordering::Less {
            smallest = &f.smallest;
        }
        if icmp.compare_keys(&f.largest, largest) == Ordering::Greater {
            largest = &f.largest;
        }
    }
    Some((smallest.clone(), largest.clone()))
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let numbers = |files: &[Arc<FileMetaData>]| -> Vec<u64> {
            files.iter().map(|f| f.number).collect()
        };
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("inputs0", &numbers(&self.inputs[0]))
            .field("inputs1", &numbers(&self.inputs[1]))
            .field("grandparents", &numbers(&self.grandparents))
            .finish()
    }
}
