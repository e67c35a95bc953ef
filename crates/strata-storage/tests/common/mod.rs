// Common test utilities for engine integration tests

use std::path::{Path, PathBuf};
use strata_core::Options;
use strata_storage::{Db, ReadOptions, WriteOptions};
use tempfile::TempDir;

/// Test fixture that owns a temporary database directory
pub struct DbTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl DbTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("db");
        Self { temp_dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open with default options, creating the database if needed
    pub fn open(&self) -> Db {
        self.open_with(Options::default())
    }

    pub fn open_with(&self, options: Options) -> Db {
        Db::open(&self.path, options.with_create_if_missing(true)).expect("Failed to open database")
    }

    /// Number of table files in each level
    #[allow(dead_code)]
    pub fn files_per_level(db: &Db) -> Vec<usize> {
        (0..strata_core::NUM_LEVELS)
            .map(|level| {
                db.get_property(&format!("strata.num-files-at-level{}", level))
                    .expect("Missing level property")
                    .parse()
                    .expect("Level property is not a number")
            })
            .collect()
    }

    /// Total bytes of the table files in the directory
    #[allow(dead_code)]
    pub fn table_bytes(&self) -> u64 {
        std::fs::read_dir(&self.path)
            .expect("Failed to list database")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".sst"))
            .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

impl Default for DbTestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Options that make flushes and compactions happen with little data
#[allow(dead_code)]
pub fn small_options() -> Options {
    Options::default()
        .with_write_buffer_size(16 * 1024)
        .with_max_file_size(8 * 1024)
        .with_block_size(1024)
}

#[allow(dead_code)]
pub fn get(db: &Db, key: &[u8]) -> Option<Vec<u8>> {
    db.get(key, &ReadOptions::default()).expect("Failed to get")
}

#[allow(dead_code)]
pub fn put(db: &Db, key: &[u8], value: &[u8]) {
    db.put(key, value, WriteOptions::default()).expect("Failed to put");
}

/// Every visible (key, value) pair, in iterator order
#[allow(dead_code)]
pub fn scan(db: &Db, options: &ReadOptions) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut it = db.new_iterator(options);
    let mut out = Vec::new();
    it.seek_to_first();
    while it.valid() {
        out.push((it.key().to_vec(), it.value().to_vec()));
        it.next();
    }
    it.status().expect("Iterator failed");
    out
}

/// A deterministic key for index `i`
#[allow(dead_code)]
pub fn key_of(i: u32) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

/// A deterministic value of `len` bytes for index `i`
#[allow(dead_code)]
pub fn value_of(i: u32, len: usize) -> Vec<u8> {
    (0..len).map(|j| b'a' + ((i as usize + j) % 26) as u8).collect()
}
