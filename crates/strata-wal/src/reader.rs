// Log reader - reassembles logical records from block-framed fragments
//
// Corrupt fragments (bad checksum, impossible length, fragments out of
// order) are reported and skipped: the reader drops the rest of the block
// and resumes at the next one. A record cut short at the end of the file is
// the normal shape of a crash mid-write and is treated as end of log.
// In strict mode every reported corruption is returned as an error instead.

use crate::record::{RecordHeader, RecordType, BLOCK_SIZE, HEADER_SIZE};
use strata_core::{Error, Result};
use std::io::Read;
use tracing::warn;

/// Outcome of reading one physical record
enum Physical {
    Record(u8, std::ops::Range<usize>),
    Eof,
    Bad,
}

/// Reads logical records from a log stream
pub struct LogReader<R: Read> {
    source: R,
    /// Current block contents
    block: Vec<u8>,
    /// Read position within `block`
    pos: usize,
    /// Source returned a short block
    eof: bool,
    strict: bool,
    dropped_bytes: u64,
    corruptions: u64,
}

impl<R: Read> LogReader<R> {
    /// Create a reader. With `strict`, corruption is an error.
    pub fn new(source: R, strict: bool) -> Self {
        Self {
            source,
            block: Vec::with_capacity(BLOCK_SIZE),
            pos: 0,
            eof: false,
            strict,
            dropped_bytes: 0,
            corruptions: 0,
        }
    }

    /// Bytes skipped because of corruption so far
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Number of corruption reports so far
    pub fn corruptions(&self) -> u64 {
        self.corruptions
    }

    /// Read the next logical record.
    ///
    /// Returns `Ok(None)` at the end of the log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Physical::Record(record_type, range) => {
                    let fragment_len = range.len();
                    match RecordType::try_from(record_type) {
                        Ok(RecordType::Full) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report(scratch.len(), "partial record without end (1)")?;
                            }
                            return Ok(Some(self.block[range].to_vec()));
                        }
                        Ok(RecordType::First) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report(scratch.len(), "partial record without end (2)")?;
                            }
                            scratch.clear();
                            scratch.extend_from_slice(&self.block[range]);
                            in_fragmented_record = true;
                        }
                        Ok(RecordType::Middle) => {
                            if !in_fragmented_record {
                                self.report(
                                    fragment_len,
                                    "missing start of fragmented record (1)",
                                )?;
                            } else {
                                scratch.extend_from_slice(&self.block[range]);
                            }
                        }
                        Ok(RecordType::Last) => {
                            if !in_fragmented_record {
                                self.report(
                                    fragment_len,
                                    "missing start of fragmented record (2)",
                                )?;
                            } else {
                                scratch.extend_from_slice(&self.block[range]);
                                return Ok(Some(scratch));
                            }
                        }
                        Ok(RecordType::Zero) | Err(_) => {
                            let pending = if in_fragmented_record { scratch.len() } else { 0 };
                            let dropped = fragment_len + pending;
                            self.report(
                                dropped,
                                &format!("unknown record type {}", record_type),
                            )?;
                            in_fragmented_record = false;
                            scratch.clear();
                        }
                    }
                }
                Physical::Eof => {
                    // A trailing FIRST/MIDDLE without its LAST is a torn write,
                    // not corruption.
                    return Ok(None);
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record")?;
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            let remaining = self.block.len() - self.pos;
            if remaining < HEADER_SIZE {
                if !self.eof {
                    // Skip the zero-filled trailer and read the next block
                    self.fill_block()?;
                    continue;
                }
                // Truncated header at end of file
                self.pos = self.block.len();
                return Ok(Physical::Eof);
            }

            let header = match RecordHeader::decode(&self.block[self.pos..]) {
                Some(header) => header,
                None => return Ok(Physical::Eof),
            };

            if HEADER_SIZE + header.length > remaining {
                let drop_size = remaining;
                self.pos = self.block.len();
                if !self.eof {
                    self.report(drop_size, "bad record length")?;
                    return Ok(Physical::Bad);
                }
                // The writer died in the middle of this record
                return Ok(Physical::Eof);
            }

            if header.record_type == RecordType::Zero as u8 && header.length == 0 {
                // Preallocated space; skip without reporting
                self.pos = self.block.len();
                return Ok(Physical::Bad);
            }

            let start = self.pos + HEADER_SIZE;
            let end = start + header.length;
            if !header.matches(&self.block[start..end]) {
                let drop_size = remaining;
                self.pos = self.block.len();
                self.report(drop_size, "checksum mismatch")?;
                return Ok(Physical::Bad);
            }

            self.pos = end;
            return Ok(Physical::Record(header.record_type, start..end));
        }
    }

    fn fill_block(&mut self) -> Result<()> {
        self.block.resize(BLOCK_SIZE, 0);
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.source.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.block.clear();
                    self.pos = 0;
                    self.eof = true;
                    return Err(e.into());
                }
            }
        }
        self.block.truncate(filled);
        self.pos = 0;
        if filled < BLOCK_SIZE {
            self.eof = true;
        }
        Ok(())
    }

    fn report(&mut self, bytes: usize, reason: &str) -> Result<()> {
        self.dropped_bytes += bytes as u64;
        self.corruptions += 1;
        if self.strict {
            return Err(Error::Corruption(format!(
                "log: {} ({} bytes dropped)",
                reason, bytes
            )));
        }
        warn!(bytes, reason, "Skipping corrupt log data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::LogWriter;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_records(records: &[Vec<u8>]) -> (TempDir, std::path::PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("000001.log");
        let mut writer = LogWriter::create(&path).expect("Failed to create writer");
        for record in records {
            writer.add_record(record).expect("Failed to append");
        }
        writer.sync().unwrap();
        (temp_dir, path)
    }

    fn read_all(path: &std::path::Path, strict: bool) -> Result<Vec<Vec<u8>>> {
        let mut reader = LogReader::new(File::open(path)?, strict);
        let mut out = Vec::new();
        while let Some(record) = reader.read_record()? {
            out.push(record);
        }
        Ok(out)
    }

    #[test]
    fn test_read_back_small_and_fragmented() {
        let records = vec![
            b"one".to_vec(),
            Vec::new(),
            vec![9u8; BLOCK_SIZE * 2 + 100],
            b"last".to_vec(),
        ];
        let (_dir, path) = write_records(&records);

        assert_eq!(read_all(&path, true).unwrap(), records);
    }

    #[test]
    fn test_empty_log() {
        let (_dir, path) = write_records(&[]);
        assert!(read_all(&path, true).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_tail_is_end_of_log() {
        let records = vec![b"complete".to_vec(), vec![3u8; 1000]];
        let (_dir, path) = write_records(&records);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();

        // Torn write is not corruption, even in strict mode
        assert_eq!(read_all(&path, true).unwrap(), vec![b"complete".to_vec()]);
    }

    #[test]
    fn test_checksum_mismatch_skips_block() {
        let first = vec![1u8; 100];
        let second = vec![2u8; BLOCK_SIZE];
        let third = b"after".to_vec();
        let (_dir, path) = write_records(&[first, second, third.clone()]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::new(File::open(&path).unwrap(), false);
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            out.push(record);
        }
        // The first block is dropped; the LAST fragment of the second record
        // in block two has no start and is dropped as well.
        assert_eq!(out, vec![third]);
        assert!(reader.dropped_bytes() > 0);
        assert!(reader.corruptions() >= 2);
    }

    #[test]
    fn test_strict_mode_reports_corruption() {
        let (_dir, path) = write_records(&[b"abc".to_vec(), b"def".to_vec()]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let err = read_all(&path, true).unwrap_err();
        assert!(err.is_corruption());
    }
}
