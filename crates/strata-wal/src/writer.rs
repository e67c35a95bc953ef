// Log writer - appends logical records, fragmenting them across blocks
use crate::record::{encode_header, RecordType, BLOCK_SIZE, HEADER_SIZE};
use strata_core::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Appends records to a single log file
pub struct LogWriter {
    file: BufWriter<File>,
    path: PathBuf,
    /// Offset within the current block
    block_offset: usize,
    /// Total bytes in the file
    size: u64,
}

impl LogWriter {
    /// Create a new, empty log file at `path`, truncating any existing file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "Created log file");
        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            block_offset: 0,
            size: 0,
        })
    }

    /// Reopen an existing log file and continue appending at its end.
    pub fn append_to(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "Reopened log file for append");
        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            block_offset: (size % BLOCK_SIZE as u64) as usize,
            size,
        })
    }

    /// Append one logical record.
    ///
    /// The bytes are handed to the operating system before returning, so
    /// they survive a process crash; call [`LogWriter::sync`] for power loss.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data;
        let mut begin = true;

        // An empty record still emits a single zero-length FULL fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Switch to a new block, zero-filling the trailer
                if leftover > 0 {
                    self.file.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                    self.size += leftover as u64;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;

            if end {
                break;
            }
        }

        self.file.flush()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        let header = encode_header(record_type, payload);
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;

        let written = HEADER_SIZE + payload.len();
        self.block_offset += written;
        self.size += written as u64;
        Ok(())
    }

    /// Flush buffered bytes to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and fsync the log file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.file.flush();
    }
}
