// Common test utilities for log integration tests

use std::fs;
use std::path::PathBuf;
use strata_wal::LogWriter;
use tempfile::TempDir;

/// Test fixture that owns a temporary directory with one log file path
pub struct LogTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub log_path: PathBuf,
}

impl LogTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log_path = temp_dir.path().join("000007.log");
        Self { temp_dir, log_path }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Write `records` to a fresh log and sync it
    pub fn write(&self, records: &[Vec<u8>]) {
        let mut writer = LogWriter::create(&self.log_path).expect("Failed to create log");
        for record in records {
            writer.add_record(record).expect("Failed to append record");
        }
        writer.sync().expect("Failed to sync log");
    }

    #[allow(dead_code)]
    pub fn corrupt_byte(&self, offset: usize) {
        let mut bytes = fs::read(&self.log_path).expect("Failed to read log");
        bytes[offset] ^= 0xFF;
        fs::write(&self.log_path, bytes).expect("Failed to rewrite log");
    }

    #[allow(dead_code)]
    pub fn truncate_by(&self, n: u64) {
        let len = fs::metadata(&self.log_path).expect("Failed to stat log").len();
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.log_path)
            .expect("Failed to open log");
        file.set_len(len.saturating_sub(n)).expect("Failed to truncate log");
    }
}

impl Default for LogTestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A deterministic record of `len` bytes derived from `seed`
#[allow(dead_code)]
pub fn record_of(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}
