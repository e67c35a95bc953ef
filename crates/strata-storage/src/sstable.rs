//! SSTable - Sorted String Table format and I/O
//!
//! SSTables are immutable on-disk files holding internal-key/value pairs in
//! sorted order. Every flushed memtable and every compaction output is one.
//!
//! ## File Format
//!
//! ```text
//! +------------------+
//! | Data Blocks      |  <- entries, optionally zstd-compressed, + trailer
//! +------------------+
//! | Index Block      |  <- one entry per data block, keyed by its last key
//! +------------------+
//! | Footer           |  <- index location + checksums + magic
//! +------------------+
//! | Footer length    |  <- u32 LE
//! +------------------+
//! ```
//!
//! A data block is a run of `len (u32 LE) | bincode(entry)` records followed
//! by a 5-byte trailer: the compression tag and a CRC32 over the stored
//! bytes plus that tag.

use crate::iterator::InternalIterator;
use crate::key::InternalKeyComparator;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::format_version::{magic, table_version, TABLE_FORMAT_VERSION};
use strata_core::{CompressionType, Error, Result};
use tracing::debug;

/// Compression tag + CRC32
const BLOCK_TRAILER_SIZE: usize = 5;

/// zstd level used for data blocks
const ZSTD_LEVEL: i32 = 3;

#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

#[derive(Deserialize)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Index entry pointing to a data block
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    /// Last key in the block
    last_key: Vec<u8>,
    /// Offset of the block in the file
    offset: u64,
    /// Size of the stored block, excluding the trailer
    size: u32,
}

/// SSTable footer containing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SSTableFooter {
    format_version: u16,
    index_offset: u64,
    index_size: u32,
    index_crc: u32,
    entry_count: u64,
    magic: u64,
    /// CRC32 of the footer encoded with `crc = 0`
    crc: u32,
}

impl SSTableFooter {
    fn checksum(&self) -> Result<u32> {
        let unsealed = SSTableFooter { crc: 0, ..self.clone() };
        let encoded =
            bincode::serialize(&unsealed).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(crc32fast::hash(&encoded))
    }
}

/// What a finished table holds
#[derive(Debug, Clone)]
pub struct SSTableSummary {
    /// Number of entries
    pub entry_count: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest internal key
    pub smallest: Vec<u8>,
    /// Largest internal key
    pub largest: Vec<u8>,
}

fn block_crc(stored: &[u8], compression: u8) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(stored);
    hasher.update(&[compression]);
    hasher.finalize()
}

/// SSTable writer - creates new SSTable files.
///
/// Keys must be added in strictly increasing internal-key order.
pub struct SSTableWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes written so far
    position: u64,
    index: Vec<IndexEntry>,
    block_buffer: Vec<u8>,
    block_size: usize,
    compression: CompressionType,
    smallest: Option<Vec<u8>>,
    last_key: Vec<u8>,
    entry_count: u64,
}

impl SSTableWriter {
    /// Create a table file at `path`, replacing any existing file.
    pub fn new(
        path: impl AsRef<Path>,
        block_size: usize,
        compression: CompressionType,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            position: 0,
            index: Vec::new(),
            block_buffer: Vec::with_capacity(block_size + 64),
            block_size,
            compression,
            smallest: None,
            last_key: Vec::new(),
            entry_count: 0,
        })
    }

    /// Add an entry to the table
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        let encoded = bincode::serialize(&EntryRef { key, value })
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.block_buffer
            .extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.block_buffer.extend_from_slice(&encoded);
        self.entry_count += 1;

        if self.block_buffer.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Flush the current block to disk
    fn flush_block(&mut self) -> Result<()> {
        if self.block_buffer.is_empty() {
            return Ok(());
        }

        let mut stored = std::mem::take(&mut self.block_buffer);
        let mut tag = CompressionType::None;
        if self.compression == CompressionType::Zstd {
            let compressed = zstd::stream::encode_all(stored.as_slice(), ZSTD_LEVEL)?;
            // Keep the raw block unless compression actually saves space
            if compressed.len() < stored.len() {
                stored = compressed;
                tag = CompressionType::Zstd;
            }
        }

        let crc = block_crc(&stored, tag.as_u8());
        self.index.push(IndexEntry {
            last_key: self.last_key.clone(),
            offset: self.position,
            size: stored.len() as u32,
        });

        self.writer.write_all(&stored)?;
        self.writer.write_all(&[tag.as_u8()])?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.position += (stored.len() + BLOCK_TRAILER_SIZE) as u64;

        stored.clear();
        self.block_buffer = stored;
        Ok(())
    }

    /// Number of entries added so far
    pub fn num_entries(&self) -> u64 {
        self.entry_count
    }

    /// Size the file would have if finished now, excluding index and footer
    pub fn file_size(&self) -> u64 {
        self.position + self.block_buffer.len() as u64
    }

    /// Path of the file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the index and footer, then sync the file.
    pub fn finish(mut self) -> Result<SSTableSummary> {
        self.flush_block()?;

        let index_offset = self.position;
        let index_encoded =
            bincode::serialize(&self.index).map_err(|e| Error::Serialization(e.to_string()))?;
        self.writer.write_all(&index_encoded)?;
        self.position += index_encoded.len() as u64;

        let mut footer = SSTableFooter {
            format_version: TABLE_FORMAT_VERSION,
            index_offset,
            index_size: index_encoded.len() as u32,
            index_crc: crc32fast::hash(&index_encoded),
            entry_count: self.entry_count,
            magic: magic::TABLE,
            crc: 0,
        };
        footer.crc = footer.checksum()?;
        let footer_encoded =
            bincode::serialize(&footer).map_err(|e| Error::Serialization(e.to_string()))?;

        self.writer.write_all(&footer_encoded)?;
        self.writer
            .write_all(&(footer_encoded.len() as u32).to_le_bytes())?;
        self.position += footer_encoded.len() as u64 + 4;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        debug!(
            path = %self.path.display(),
            entries = self.entry_count,
            size = self.position,
            "Finished table"
        );

        Ok(SSTableSummary {
            entry_count: self.entry_count,
            file_size: self.position,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.last_key,
        })
    }
}

/// Read exactly `buf.len()` bytes at `offset` without moving the cursor
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// `seek_read` moves the cursor, but every read here is positional
#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        pos += n;
    }
    Ok(())
}

/// SSTable reader - an open, immutable table file.
///
/// Shared between threads through the table cache. Block reads are
/// positional, so concurrent readers do not wait on each other.
pub struct SSTableReader {
    file: File,
    index: Vec<IndexEntry>,
    footer: SSTableFooter,
    cmp: InternalKeyComparator,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("index", &self.index)
            .field("footer", &self.footer)
            .finish_non_exhaustive()
    }
}

impl SSTableReader {
    /// Open a table file, validating its footer and index.
    pub fn open(path: impl AsRef<Path>, cmp: InternalKeyComparator) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < 4 {
            return Err(Error::Corruption(format!(
                "{}: table too small",
                path.display()
            )));
        }

        let mut footer_len_buf = [0u8; 4];
        read_exact_at(&file, &mut footer_len_buf, file_size - 4)?;
        let footer_len = u32::from_le_bytes(footer_len_buf) as u64;
        if footer_len + 4 > file_size {
            return Err(Error::Corruption(format!(
                "{}: bad footer length {}",
                path.display(),
                footer_len
            )));
        }

        let mut footer_buf = vec![0u8; footer_len as usize];
        read_exact_at(&file, &mut footer_buf, file_size - 4 - footer_len)?;
        let footer: SSTableFooter = bincode::deserialize(&footer_buf).map_err(|e| {
            Error::Corruption(format!("{}: bad table footer: {}", path.display(), e))
        })?;

        if footer.magic != magic::TABLE {
            return Err(Error::Corruption(format!(
                "{}: not a table file (bad magic)",
                path.display()
            )));
        }
        if !table_version().can_read(footer.format_version) {
            return Err(Error::Corruption(format!(
                "{}: unsupported table format version {}",
                path.display(),
                footer.format_version
            )));
        }
        if footer.checksum()? != footer.crc {
            return Err(Error::Corruption(format!(
                "{}: table footer checksum mismatch",
                path.display()
            )));
        }
        if footer.index_offset + footer.index_size as u64 > file_size {
            return Err(Error::Corruption(format!(
                "{}: index extends past end of file",
                path.display()
            )));
        }

        let mut index_buf = vec![0u8; footer.index_size as usize];
        read_exact_at(&file, &mut index_buf, footer.index_offset)?;
        if crc32fast::hash(&index_buf) != footer.index_crc {
            return Err(Error::Corruption(format!(
                "{}: table index checksum mismatch",
                path.display()
            )));
        }
        let index: Vec<IndexEntry> = bincode::deserialize(&index_buf).map_err(|e| {
            Error::Corruption(format!("{}: bad table index: {}", path.display(), e))
        })?;

        Ok(Self {
            file,
            index,
            footer,
            cmp,
        })
    }

    /// Number of entries
    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    /// Index of the first block whose last key is >= `target`
    fn find_block(&self, target: &[u8]) -> usize {
        self.index
            .partition_point(|e| self.cmp.compare(&e.last_key, target) == Ordering::Less)
    }

    /// Read and decode a data block
    fn read_block(&self, block_idx: usize, verify_checksums: bool) -> Result<Vec<Entry>> {
        let handle = &self.index[block_idx];
        let mut buf = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
        read_exact_at(&self.file, &mut buf, handle.offset)?;

        let stored_len = handle.size as usize;
        let tag = buf[stored_len];
        if verify_checksums {
            let mut crc_buf = [0u8; 4];
            crc_buf.copy_from_slice(&buf[stored_len + 1..]);
            if u32::from_le_bytes(crc_buf) != block_crc(&buf[..stored_len], tag) {
                return Err(Error::Corruption(format!(
                    "block checksum mismatch at offset {}",
                    handle.offset
                )));
            }
        }

        buf.truncate(stored_len);
        let data = match CompressionType::from_u8(tag) {
            Some(CompressionType::None) => buf,
            Some(CompressionType::Zstd) => zstd::stream::decode_all(buf.as_slice())
                .map_err(|e| Error::Corruption(format!("bad compressed block: {}", e)))?,
            None => {
                return Err(Error::Corruption(format!(
                    "unknown block compression type {}",
                    tag
                )))
            }
        };

        decode_block(&data)
    }

    /// First entry with internal key >= `target`, if any.
    pub fn get(&self, target: &[u8], verify_checksums: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let block_idx = self.find_block(target);
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let entries = self.read_block(block_idx, verify_checksums)?;
        Ok(entries
            .into_iter()
            .find(|e| self.cmp.compare(&e.key, target) != Ordering::Less)
            .map(|e| (e.key, e.value)))
    }

    /// Approximate file offset where `key` would be stored
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let block_idx = self.find_block(key);
        match self.index.get(block_idx) {
            Some(handle) => handle.offset,
            // Past the last key: close to the end of the file
            None => self.footer.index_offset,
        }
    }

    /// Cursor over all entries
    pub fn iter(self: &Arc<Self>, verify_checksums: bool) -> SSTableIterator {
        SSTableIterator {
            table: Arc::clone(self),
            verify_checksums,
            block_idx: 0,
            entries: Vec::new(),
            pos: None,
            status: Ok(()),
        }
    }
}

fn decode_block(data: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(Error::Corruption("truncated block entry length".into()));
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > data.len() {
            return Err(Error::Corruption("block entry extends past block".into()));
        }
        let entry: Entry = bincode::deserialize(&data[offset..offset + len])
            .map_err(|e| Error::Corruption(format!("bad block entry: {}", e)))?;
        entries.push(entry);
        offset += len;
    }
    Ok(entries)
}

/// Iterator over SSTable entries, one decoded block at a time
pub struct SSTableIterator {
    table: Arc<SSTableReader>,
    verify_checksums: bool,
    block_idx: usize,
    entries: Vec<Entry>,
    pos: Option<usize>,
    status: Result<()>,
}

impl SSTableIterator {
    fn load_block(&mut self, block_idx: usize) -> bool {
        self.pos = None;
        self.entries.clear();
        if block_idx >= self.table.index.len() {
            return false;
        }
        match self.table.read_block(block_idx, self.verify_checksums) {
            Ok(entries) => {
                self.block_idx = block_idx;
                self.entries = entries;
                true
            }
            Err(e) => {
                self.status = Err(e);
                false
            }
        }
    }

    /// Move forward past empty blocks
    fn skip_forward(&mut self) {
        while self.pos.is_none() {
            let next = self.block_idx + 1;
            if !self.load_block(next) {
                return;
            }
            if !self.entries.is_empty() {
                self.pos = Some(0);
            }
        }
    }
}

impl InternalIterator for SSTableIterator {
    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn seek_to_first(&mut self) {
        if self.load_block(0) {
            if self.entries.is_empty() {
                self.skip_forward();
            } else {
                self.pos = Some(0);
            }
        }
    }

    fn seek_to_last(&mut self) {
        let mut block_idx = self.table.index.len();
        while block_idx > 0 {
            block_idx -= 1;
            if !self.load_block(block_idx) {
                return;
            }
            if !self.entries.is_empty() {
                self.pos = Some(self.entries.len() - 1);
                return;
            }
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let block_idx = self.table.find_block(target);
        if !self.load_block(block_idx) {
            return;
        }
        let cmp = &self.table.cmp;
        let i = self
            .entries
            .partition_point(|e| cmp.compare(&e.key, target) == Ordering::Less);
        if i < self.entries.len() {
            self.pos = Some(i);
        } else {
            self.skip_forward();
        }
    }

    fn next(&mut self) {
        let Some(pos) = self.pos else {
            return;
        };
        if pos + 1 < self.entries.len() {
            self.pos = Some(pos + 1);
        } else {
            self.pos = None;
            self.skip_forward();
        }
    }

    fn prev(&mut self) {
        let Some(pos) = self.pos else {
            return;
        };
        if pos > 0 {
            self.pos = Some(pos - 1);
            return;
        }
        let mut block_idx = self.block_idx;
        while block_idx > 0 {
            block_idx -= 1;
            if !self.load_block(block_idx) {
                return;
            }
            if !self.entries.is_empty() {
                self.pos = Some(self.entries.len() - 1);
                return;
            }
        }
        self.pos = None;
    }

    fn key(&self) -> &[u8] {
        match self.pos {
            Some(p) => &self.entries[p].key,
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.pos {
            Some(p) => &self.entries[p].value,
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{InternalKey, ValueType};
    use strata_core::BytewiseComparator;
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &str, seq: u64) -> Vec<u8> {
        InternalKey::new(user_key.as_bytes(), seq, ValueType::Value)
            .encoded()
            .to_vec()
    }

    fn build(path: &Path, count: usize, compression: CompressionType) -> SSTableSummary {
        let mut writer = SSTableWriter::new(path, 256, compression).unwrap();
        for i in 0..count {
            let key = ikey(&format!("key{:04}", i), 1);
            let value = format!("value{}", i).repeat(4);
            writer.add(&key, value.as_bytes()).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_sstable_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let summary = build(&path, 3, CompressionType::None);

        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.smallest, ikey("key0000", 1));
        assert_eq!(summary.largest, ikey("key0002", 1));
        assert_eq!(summary.file_size, std::fs::metadata(&path).unwrap().len());

        let reader = SSTableReader::open(&path, icmp()).unwrap();
        let (key, value) = reader.get(&ikey("key0001", 5), true).unwrap().unwrap();
        assert_eq!(key, ikey("key0001", 1));
        assert_eq!(value, b"value1value1value1value1");

        // Past the last key
        assert!(reader.get(&ikey("zzz", 5), true).unwrap().is_none());
    }

    #[test]
    fn test_sstable_concurrent_readers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000005.sst");
        build(&path, 400, CompressionType::None);
        let reader = Arc::new(SSTableReader::open(&path, icmp()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    for i in (t..400).step_by(4) {
                        let user_key = format!("key{:04}", i);
                        let (key, value) = reader.get(&ikey(&user_key, 5), true).unwrap().unwrap();
                        assert_eq!(key, ikey(&user_key, 1));
                        assert_eq!(value, format!("value{}", i).repeat(4).into_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_sstable_iterator_both_directions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000002.sst");
        build(&path, 100, CompressionType::None);

        let reader = Arc::new(SSTableReader::open(&path, icmp()).unwrap());
        assert_eq!(reader.entry_count(), 100);

        let mut iter = reader.iter(true);
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 100);

        iter.seek_to_last();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.prev();
        }
        assert_eq!(count, 100);

        iter.seek(&ikey("key0050", 9));
        assert_eq!(iter.key(), ikey("key0050", 1).as_slice());
        iter.prev();
        assert_eq!(iter.key(), ikey("key0049", 1).as_slice());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_sstable_zstd_blocks() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("000003.sst");
        let packed = dir.path().join("000004.sst");
        let plain_size = build(&plain, 200, CompressionType::None).file_size;
        let packed_size = build(&packed, 200, CompressionType::Zstd).file_size;
        assert!(packed_size < plain_size);

        let reader = SSTableReader::open(&packed, icmp()).unwrap();
        let (_, value) = reader.get(&ikey("key0150", 1), true).unwrap().unwrap();
        assert_eq!(value, b"value150value150value150value150");
    }

    #[test]
    fn test_sstable_detects_corrupt_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000005.sst");
        build(&path, 10, CompressionType::None);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let reader = Arc::new(SSTableReader::open(&path, icmp()).unwrap());
        let err = reader.get(&ikey("key0000", 1), true).unwrap_err();
        assert!(err.is_corruption());

        let mut iter = reader.iter(true);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());
    }

    #[test]
    fn test_sstable_rejects_bad_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000006.sst");
        std::fs::write(&path, b"not a table at all").unwrap();
        assert!(SSTableReader::open(&path, icmp()).is_err());
    }

    #[test]
    fn test_sstable_approximate_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000007.sst");
        build(&path, 500, CompressionType::None);

        let reader = SSTableReader::open(&path, icmp()).unwrap();
        let start = reader.approximate_offset_of(&ikey("a", 1));
        let middle = reader.approximate_offset_of(&ikey("key0250", 1));
        let end = reader.approximate_offset_of(&ikey("zzz", 1));
        assert_eq!(start, 0);
        assert!(middle > start);
        assert!(end > middle);
    }
}
