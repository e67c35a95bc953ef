//! Version edits - the records of the manifest.
//!
//! Each edit describes the delta from one version to the next: files added
//! and removed per level plus updated counters. The first edit of every
//! manifest is a full snapshot of the current version.

use crate::key::InternalKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use strata_core::format_version::{magic, manifest_version, MANIFEST_FORMAT_VERSION};
use strata_core::{Error, Result, SequenceNumber};

/// A table file as recorded in the manifest
#[derive(Serialize, Deserialize)]
pub struct FileMetaData {
    /// File number (`NNNNNN.sst`)
    pub number: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest internal key in the file
    pub smallest: InternalKey,
    /// Largest internal key in the file
    pub largest: InternalKey,
    /// Seeks left before the file is nominated for compaction
    #[serde(skip)]
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    /// Metadata for a newly written file
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(0),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({} bytes) [{:?} .. {:?}]",
            self.number, self.file_size, self.smallest, self.largest
        )
    }
}

/// Delta between two versions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionEdit {
    /// `(magic, format version)`; present on the first edit of a manifest
    pub format: Option<(u32, u16)>,
    /// Name of the user comparator
    pub comparator: Option<String>,
    /// Logs numbered below this are no longer needed
    pub log_number: Option<u64>,
    /// Log still being compacted when the manifest was written
    pub prev_log_number: Option<u64>,
    /// Next unused file number
    pub next_file_number: Option<u64>,
    /// Last sequence number in use
    pub last_sequence: Option<SequenceNumber>,
    /// Where the next size compaction of a level should start
    pub compact_pointers: Vec<(usize, InternalKey)>,
    /// Removed files as `(level, number)`
    pub deleted_files: BTreeSet<(usize, u64)>,
    /// Added files
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    /// Mark this edit as the first record of a manifest
    pub fn set_format_header(&mut self) {
        self.format = Some((magic::MANIFEST, MANIFEST_FORMAT_VERSION));
    }

    /// Set the comparator name
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    /// Set the log number
    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    /// Set the previous log number
    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    /// Set the next file number
    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    /// Set the last sequence number
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    /// Record the compaction pointer of `level`
    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Add a file to `level`
    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        self.new_files.push((level, file));
    }

    /// Remove file `number` from `level`
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// Serialize for the manifest log
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a manifest record
    pub fn decode(data: &[u8]) -> Result<Self> {
        let edit: VersionEdit = bincode::deserialize(data)
            .map_err(|e| Error::Corruption(format!("bad version edit: {}", e)))?;
        if let Some((found_magic, version)) = edit.format {
            if found_magic != magic::MANIFEST {
                return Err(Error::Corruption("bad manifest magic".to_string()));
            }
            if !manifest_version().can_read(version) {
                return Err(Error::Corruption(format!(
                    "unsupported manifest format version {}",
                    version
                )));
            }
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueType;

    fn ikey(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key, seq, ValueType::Value)
    }

    #[test]
    fn test_version_edit_encoding() {
        let mut edit = VersionEdit::default();
        edit.set_format_header();
        edit.set_comparator_name("strata.BytewiseComparator");
        edit.set_log_number(7);
        edit.set_next_file_number(12);
        edit.set_last_sequence(99);
        edit.set_compact_pointer(1, ikey(b"m", 5));
        edit.remove_file(2, 4);
        edit.add_file(0, FileMetaData::new(11, 1024, ikey(b"a", 1), ikey(b"z", 9)));

        let decoded = VersionEdit::decode(&edit.encode().unwrap()).unwrap();
        assert_eq!(decoded.comparator.as_deref(), Some("strata.BytewiseComparator"));
        assert_eq!(decoded.log_number, Some(7));
        assert_eq!(decoded.prev_log_number, None);
        assert_eq!(decoded.next_file_number, Some(12));
        assert_eq!(decoded.last_sequence, Some(99));
        assert_eq!(decoded.compact_pointers, vec![(1, ikey(b"m", 5))]);
        assert!(decoded.deleted_files.contains(&(2, 4)));

        let (level, file) = &decoded.new_files[0];
        assert_eq!(*level, 0);
        assert_eq!(file.number, 11);
        assert_eq!(file.largest, ikey(b"z", 9));
        assert_eq!(file.allowed_seeks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_version_edit_rejects_garbage() {
        let err = VersionEdit::decode(&[0xff; 3]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_version_edit_rejects_foreign_magic() {
        let edit = VersionEdit {
            format: Some((0xdead_beef, 1)),
            ..Default::default()
        };
        let err = VersionEdit::decode(&edit.encode().unwrap()).unwrap_err();
        assert!(err.is_corruption());
    }
}
