// Log replay - feeds every surviving record of a log file to a callback
//
// Used both for write-ahead logs (where skipped corruption is tolerated
// unless paranoid checks are on) and for manifests (always strict).

use crate::reader::LogReader;
use strata_core::Result;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Statistics about one replayed log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Logical records handed to the callback
    pub records: u64,
    /// Payload bytes handed to the callback
    pub bytes: u64,
    /// Bytes skipped because of corruption
    pub dropped_bytes: u64,
    /// Number of corruption reports
    pub corruptions: u64,
}

/// Replays one log file
pub struct RecoveryManager {
    path: PathBuf,
    strict: bool,
}

impl RecoveryManager {
    /// Replay `path`; with `strict`, any corruption aborts the replay.
    pub fn new(path: &Path, strict: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            strict,
        }
    }

    /// Hand every logical record to `apply`, in file order.
    ///
    /// An error from `apply` stops the replay and is returned as-is.
    pub fn replay<F>(&self, mut apply: F) -> Result<RecoveryStats>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let file = File::open(&self.path)?;
        let mut reader = LogReader::new(BufReader::new(file), self.strict);
        let mut stats = RecoveryStats::default();

        while let Some(record) = reader.read_record()? {
            stats.records += 1;
            stats.bytes += record.len() as u64;
            apply(&record)?;
        }

        stats.dropped_bytes = reader.dropped_bytes();
        stats.corruptions = reader.corruptions();

        if stats.corruptions > 0 {
            warn!(
                path = %self.path.display(),
                dropped_bytes = stats.dropped_bytes,
                corruptions = stats.corruptions,
                "Log replay skipped corrupt data"
            );
        }
        debug!(
            path = %self.path.display(),
            records = stats.records,
            bytes = stats.bytes,
            "Log replay complete"
        );

        Ok(stats)
    }
}
