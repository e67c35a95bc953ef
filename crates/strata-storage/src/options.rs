//! Per-call read and write options.

use strata_snapshot::Snapshot;

/// Options for a single read or iterator
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Verify block checksums of every table block read
    pub verify_checksums: bool,
    /// Read as of this snapshot instead of the latest state
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    /// Default read options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `verify_checksums`
    pub fn with_verify_checksums(mut self, value: bool) -> Self {
        self.verify_checksums = value;
        self
    }

    /// Read at `snapshot`
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Options for a single write
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the log before the write is acknowledged
    pub sync: bool,
    /// Return a snapshot pinned at the write's last sequence number
    pub snapshot: bool,
}

impl WriteOptions {
    /// Default write options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `sync`
    pub fn with_sync(mut self, value: bool) -> Self {
        self.sync = value;
        self
    }

    /// Set `snapshot`
    pub fn with_snapshot(mut self, value: bool) -> Self {
        self.snapshot = value;
        self
    }
}
