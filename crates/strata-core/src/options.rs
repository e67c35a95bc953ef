//! Engine configuration.
//!
//! [`Options`] is fixed for the lifetime of an open engine. Per-call
//! read/write options live next to the engine in `strata-storage` because
//! they carry snapshot handles.

use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Default memtable size before it is frozen and flushed (4MB)
const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default target size of a sorted-table file (2MB)
const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Block compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Blocks are stored as-is
    #[default]
    None,
    /// Blocks are compressed with zstd
    Zstd,
}

impl CompressionType {
    /// On-disk tag byte
    pub fn as_u8(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zstd => 1,
        }
    }

    /// Parse an on-disk tag byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of level-0 files that triggers a compaction
    pub l0_compaction_trigger: usize,
    /// Number of level-0 files at which each write is delayed once
    pub l0_slowdown_writes_trigger: usize,
    /// Number of level-0 files at which writes block until compaction catches up
    pub l0_stop_writes_trigger: usize,
    /// Maximum total size of level 1 in bytes
    pub max_bytes_for_level_base: u64,
    /// Size multiplier between levels (level N+1 may be this many times larger)
    pub level_size_multiplier: u64,
    /// Deepest level a flushed memtable may be placed into directly
    pub max_mem_compact_level: usize,
    /// Upper bound on the bytes of one compaction, as a multiple of `max_file_size`
    pub expanded_compaction_factor: u64,
    /// Output files are cut once they overlap this many `max_file_size`s of grandparent data
    pub grandparent_overlap_factor: u64,
    /// Enable the seek-triggered compaction
    pub seek_compaction: bool,
    /// One seek is charged per this many bytes of file size
    pub bytes_per_seek: u64,
    /// Floor for the seek budget of a single file
    pub min_allowed_seeks: i64,
    /// Average number of bytes an iterator reads between samples
    pub read_sample_period: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            max_bytes_for_level_base: 10 * 1024 * 1024, // 10MB
            level_size_multiplier: 10,
            max_mem_compact_level: 2,
            expanded_compaction_factor: 25,
            grandparent_overlap_factor: 10,
            seek_compaction: true,
            bytes_per_seek: 16 * 1024,
            min_allowed_seeks: 100,
            read_sample_period: 1024 * 1024,
        }
    }
}

impl CompactionConfig {
    /// Maximum total bytes for a level before it is scheduled for compaction.
    ///
    /// Level 0 is governed by file count instead; this returns the level-1
    /// budget for it.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut result = self.max_bytes_for_level_base;
        let mut level = level;
        while level > 1 {
            result = result.saturating_mul(self.level_size_multiplier);
            level -= 1;
        }
        result
    }
}

/// Engine options supplied at open time
#[derive(Clone)]
pub struct Options {
    /// Create the database directory and an empty manifest if missing
    pub create_if_missing: bool,
    /// Fail if the database already exists
    pub error_if_exists: bool,
    /// Treat any detected corruption as fatal, including during log replay
    pub paranoid_checks: bool,
    /// Bytes buffered in the memtable before it is frozen and flushed
    pub write_buffer_size: usize,
    /// Upper bound on table files held open by the table cache
    pub max_open_files: usize,
    /// Approximate uncompressed size of a table data block
    pub block_size: usize,
    /// Ordering of user keys
    pub comparator: Arc<dyn Comparator>,
    /// Block compression codec for new tables
    pub compression: CompressionType,
    /// Target size of a table file produced by compaction
    pub max_file_size: u64,
    /// Keep appending to the last log and manifest found on open
    pub reuse_logs: bool,
    /// Compaction tuning
    pub compaction: CompactionConfig,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_size", &self.block_size)
            .field("comparator", &self.comparator.name())
            .field("compression", &self.compression)
            .field("max_file_size", &self.max_file_size)
            .field("reuse_logs", &self.reuse_logs)
            .field("compaction", &self.compaction)
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_open_files: 1000,
            block_size: 4096,
            comparator: Arc::new(BytewiseComparator),
            compression: CompressionType::None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            reuse_logs: false,
            compaction: CompactionConfig::default(),
        }
    }
}

impl Options {
    /// Set `create_if_missing`
    pub fn with_create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Set `error_if_exists`
    pub fn with_error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Set `paranoid_checks`
    pub fn with_paranoid_checks(mut self, value: bool) -> Self {
        self.paranoid_checks = value;
        self
    }

    /// Set the memtable size
    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Set the open-file budget of the table cache
    pub fn with_max_open_files(mut self, files: usize) -> Self {
        self.max_open_files = files;
        self
    }

    /// Set the table block size
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the user-key comparator
    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Set the block compression codec
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Set the target table file size
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Set `reuse_logs`
    pub fn with_reuse_logs(mut self, value: bool) -> Self {
        self.reuse_logs = value;
        self
    }

    /// Replace the compaction configuration
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Table cache capacity derived from `max_open_files`, leaving room
    /// for the log, manifest, lock and a few transient files.
    pub fn table_cache_capacity(&self) -> usize {
        self.max_open_files.saturating_sub(10).max(1)
    }

    /// Compaction byte budget once level inputs are expanded
    pub fn expanded_compaction_byte_limit(&self) -> u64 {
        self.compaction.expanded_compaction_factor * self.max_file_size
    }

    /// Grandparent overlap after which a compaction output file is cut
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.compaction.grandparent_overlap_factor * self.max_file_size
    }

    /// Reject option combinations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "write_buffer_size must be positive".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidArgument(
                "block_size must be positive".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(Error::InvalidArgument(
                "max_file_size must be positive".to_string(),
            ));
        }
        let c = &self.compaction;
        if c.l0_compaction_trigger == 0
            || c.l0_compaction_trigger > c.l0_slowdown_writes_trigger
            || c.l0_slowdown_writes_trigger > c.l0_stop_writes_trigger
        {
            return Err(Error::InvalidArgument(format!(
                "level-0 triggers must satisfy 0 < compaction ({}) <= slowdown ({}) <= stop ({})",
                c.l0_compaction_trigger, c.l0_slowdown_writes_trigger, c.l0_stop_writes_trigger
            )));
        }
        if c.max_mem_compact_level >= NUM_LEVELS - 1 {
            return Err(Error::InvalidArgument(format!(
                "max_mem_compact_level must be below {}",
                NUM_LEVELS - 1
            )));
        }
        if c.bytes_per_seek == 0 || c.read_sample_period == 0 {
            return Err(Error::InvalidArgument(
                "seek tunables must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = Options::default();
        assert!(!options.create_if_missing);
        assert_eq!(options.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.comparator.name(), "strata.BytewiseComparator");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_level_budgets_grow_tenfold() {
        let config = CompactionConfig::default();
        assert_eq!(config.max_bytes_for_level(1), 10 * 1024 * 1024);
        assert_eq!(config.max_bytes_for_level(2), 100 * 1024 * 1024);
        assert_eq!(config.max_bytes_for_level(3), 1000 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_bad_triggers() {
        let mut compaction = CompactionConfig::default();
        compaction.l0_slowdown_writes_trigger = 20;
        let options = Options::default().with_compaction(compaction);
        assert!(matches!(options.validate(), Err(Error::InvalidArgument(_))));

        let options = Options::default().with_block_size(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_compression_tags() {
        for c in [CompressionType::None, CompressionType::Zstd] {
            assert_eq!(CompressionType::from_u8(c.as_u8()), Some(c));
        }
        assert_eq!(CompressionType::from_u8(9), None);
    }
}
